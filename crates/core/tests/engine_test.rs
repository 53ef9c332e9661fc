//! End-to-end tests driving the engine the way a client would: resolve a
//! description, train on a gallery, project, compare, collect scores.

use template_pipeline_core::{
    distance_from, transform_from, Context, Mat, MatrixOutput, Output, Record,
    Template, TemplateList, Value, REJECTED,
};

fn gallery(labels: &[(&str, usize)]) -> TemplateList {
    let mut list = TemplateList::new();
    for (label, count) in labels {
        for i in 0..*count {
            let mut record = Record::new(format!("{label}-{i}"));
            record.set("Label", Value::Str(label.to_string()));
            list.push(Template::with_channel(
                record,
                Mat::from_elem((2, 2), i as f32),
            ));
        }
    }
    list
}

#[test]
fn identity_then_discard_keeps_metadata_only() {
    let ctx = Context::initialized();
    let transform = transform_from("Identity+Discard", &ctx).unwrap();

    let mut record = Record::new("probe");
    record.set("Label", Value::Str("alice".to_string()));
    let input: TemplateList = vec![Template::with_channel(
        record,
        Mat::from_elem((3, 3), 1.0),
    )]
    .into();

    let output = transform.project_list(&input, &ctx);
    assert_eq!(output.len(), 1);
    assert!(output[0].is_empty());
    assert_eq!(output[0].record.get_str_or("Label", ""), "alice");
    assert_eq!(output[0].record.name, "probe");
}

#[test]
fn enroll_and_compare_through_descriptions() {
    let mut ctx = Context::initialized();
    ctx.set_parallelism(4);

    let data = gallery(&[("a", 3), ("b", 3)]);
    let mut enroll = transform_from("Center", &ctx).unwrap();
    enroll.train(&data, &ctx).unwrap();

    let targets = enroll.project_list(&data, &ctx);
    let queries = targets.clone();

    let distance = distance_from("L2", &ctx).unwrap();
    let mut output = MatrixOutput::default();
    let records: Vec<Record> = targets.iter().map(|t| t.record.clone()).collect();
    output.initialize(&records, &records);
    assert!(output.self_similar());

    distance.compare_lists(&targets, &queries, &output, &ctx);

    // Identical elements score highest on the diagonal.
    for i in 0..targets.len() {
        assert_eq!(output.get(i, i), 0.0);
        for j in 0..targets.len() {
            assert!(output.get(i, j) <= 0.0);
        }
    }
}

#[test]
fn demographic_filter_rejects_without_comparison() {
    let mut ctx = Context::initialized();
    ctx.add_filter("Site", "^lab$").unwrap();

    let distance = distance_from("L1", &ctx).unwrap();
    let mut target = Template::with_channel(Record::new("t"), Mat::from_elem((1, 1), 0.0));
    target.record.set("Site", Value::Str("field".to_string()));
    let query = Template::with_channel(Record::new("q"), Mat::from_elem((1, 1), 0.0));

    assert_eq!(distance.compare(&target, &query, &ctx), REJECTED);

    target.record.set("Site", Value::Str("lab".to_string()));
    assert_eq!(distance.compare(&target, &query, &ctx), 0.0);
}

#[test]
fn cached_persistent_graph_resolves_and_projects() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = Context::initialized();
    ctx.scratch_dir = dir.path().to_path_buf();
    ctx.add_abbreviation("Enroller", "{<Center>}");

    let data = gallery(&[("a", 2), ("b", 2)]);
    let mut transform = transform_from("Enroller", &ctx).unwrap();
    transform.train(&data, &ctx).unwrap();
    let expected = transform.project_list(&data, &ctx);

    // A second resolution of the same description loads the stored model
    // instead of training.
    let mut reloaded = transform_from("Enroller", &ctx).unwrap();
    reloaded.train(&TemplateList::new(), &ctx).unwrap();
    let actual = reloaded.project_list(&data, &ctx);
    assert_eq!(expected.0, actual.0);
}

#[test]
fn open_transform_reads_raw_fixtures() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::initialized();

    // Write a fixture through the raw format, then open it by description.
    let path = dir.path().join("probe.raw").display().to_string();
    let fixture = Template::with_channel(
        Record::new(path.clone()),
        Mat::from_shape_fn((2, 2), |(r, c)| (r + c) as f32),
    );
    let format = ctx.formats.make("raw", &[], &ctx).unwrap();
    format.write(&fixture, &fixture.record).unwrap();

    let open = transform_from("Open", &ctx).unwrap();
    let input: TemplateList = vec![Template::new(Record::new(path))].into();
    let output = open.project_list(&input, &ctx);
    assert_eq!(output[0].channels.len(), 1);
    assert!(!output[0].record.failed());
}

#[test]
fn streamed_file_source_yields_every_frame_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::initialized();

    // A raw file with 12 single-row frames.
    let path = dir.path().join("clip.raw").display().to_string();
    let mut clip = Template::new(Record::new(path.clone()));
    for i in 0..12 {
        clip.channels.push(Mat::from_elem((1, 1), i as f32));
    }
    let format = ctx.formats.make("raw", &[], &ctx).unwrap();
    format.write(&clip, &clip.record).unwrap();

    let mut stream = transform_from("Stream([Identity],maxFrames=4)", &ctx).unwrap();
    let mut data: TemplateList = vec![Template::new(Record::new(path))].into();
    stream.project_update(&mut data, &ctx);

    assert_eq!(data.len(), 12);
    for (i, frame) in data.iter().enumerate() {
        assert_eq!(frame.channels[0][[0, 0]], i as f32);
    }
}

#[test]
fn labels_are_interned_once_across_threads() {
    let mut ctx = Context::initialized();
    ctx.set_parallelism(8);

    let data = gallery(&[("x", 40), ("y", 40)]);
    let labels = data.labels(&ctx.labels);
    assert_eq!(ctx.labels.len(), 2);
    assert!(labels.iter().all(|&l| l == 0.0 || l == 1.0));
}
