//! The streaming pipeline: frame pool, frame sources, and the stream
//! transform wiring per-frame processing stages together
//!
//! N transforms become N+2 stages over N+1 shared buffers. The read stage
//! runs on the caller's thread and draws frames from a fixed-capacity pool,
//! which is the pipeline's backpressure mechanism: once pool-capacity frames
//! are in flight the read stage blocks until the collection stage returns
//! one. Every frame is exclusively owned by one of pool, buffer or stage at
//! any instant; ownership moves with the frame value.

use crate::buffer::{DoubleBuffer, SharedBuffer};
use crate::context::Context;
use crate::params::{ParamDesc, ParamKind, ParamValue, Parameterized};
use crate::transform::Transform;
use std::sync::atomic::{AtomicUsize, Ordering};
use template_pipeline_common::{
    ConfigError, ProcessError, Template, TemplateList, FAILED_OPEN,
};
use tracing::{debug, warn};

/// A reusable, pool-owned unit carrying one sequence-numbered payload
/// through the pipeline.
#[derive(Debug, Default)]
pub struct Frame {
    pub sequence: i64,
    pub data: TemplateList,
}

/// Fixed-capacity pool all in-flight frames are drawn from.
pub struct FramePool {
    frames: DoubleBuffer<Frame>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let frames = DoubleBuffer::new();
        for _ in 0..capacity {
            frames.add_item(Frame::default());
        }
        frames.start_input();
        Self {
            frames,
            capacity,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a recycled frame, blocking while the pool is exhausted. Only
    /// returns `None` after the pool is shut down.
    pub fn checkout(&self) -> Option<Frame> {
        let mut frame = self.frames.get_item()?;
        frame.sequence = -1;
        frame.data.clear();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Some(frame)
    }

    pub fn give_back(&self, frame: Frame) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.frames.add_item(frame);
    }

    /// Frames currently outside the pool.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The high-water mark of concurrently in-flight frames.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

/// Sequential access to a frame sequence.
pub trait FrameSource: Send {
    fn is_open(&self) -> bool;

    /// Fill the next frame's payload and sequence number. Returns false
    /// once the source is exhausted, leaving the frame untouched.
    fn next_frame(&mut self, frame: &mut Frame) -> bool;

    fn close(&mut self);
}

/// Iterates an already-in-memory template's channels as frames.
pub struct TemplateSource {
    basis: Template,
    index: usize,
    next_sequence: i64,
}

impl TemplateSource {
    pub fn new(basis: Template) -> Self {
        Self {
            basis,
            index: 0,
            next_sequence: 0,
        }
    }
}

impl FrameSource for TemplateSource {
    fn is_open(&self) -> bool {
        self.index < self.basis.channels.len()
    }

    fn next_frame(&mut self, frame: &mut Frame) -> bool {
        if !self.is_open() {
            return false;
        }
        frame.data.push(Template::with_channel(
            self.basis.record.clone(),
            self.basis.channels[self.index].clone(),
        ));
        self.index += 1;
        frame.sequence = self.next_sequence;
        self.next_sequence += 1;
        true
    }

    fn close(&mut self) {
        self.index = usize::MAX;
    }
}

/// Picks the right source for a template: its own channels when they are
/// already in memory, otherwise the record's file decoded through the
/// format registry.
pub fn open_source(template: &Template, ctx: &Context) -> Result<TemplateSource, ProcessError> {
    if !template.is_empty() {
        return Ok(TemplateSource::new(template.clone()));
    }

    let extension = std::path::Path::new(&template.record.name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let format = ctx
        .formats
        .make(&extension, &[], ctx)
        .map_err(|e| ProcessError::UnsupportedFormat(e.to_string()))?;
    let decoded = format.read(&template.record)?;
    if decoded.is_empty() {
        return Err(ProcessError::OpenFailed(template.record.name.clone()));
    }
    debug!(
        file = %template.record.flat(),
        frames = decoded.channels.len(),
        "opened frame source"
    );
    Ok(TemplateSource::new(decoded))
}

/// Applies an ordered list of transforms to a frame sequence with
/// stage-level pipelining: stage k processes frame i while stage k+1
/// processes frame i-1. Registered as `Stream`.
pub struct StreamTransform {
    transforms: Vec<Box<dyn Transform>>,
    max_frames: i64,
    last_peak_in_flight: usize,
}

impl StreamTransform {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self {
            transforms,
            max_frames: 100,
            last_peak_in_flight: 0,
        }
    }

    pub fn with_pool_capacity(transforms: Vec<Box<dyn Transform>>, max_frames: usize) -> Self {
        let mut stream = Self::new(transforms);
        stream.max_frames = max_frames as i64;
        stream
    }

    /// The high-water mark of in-flight frames during the most recent run.
    pub fn last_peak_in_flight(&self) -> usize {
        self.last_peak_in_flight
    }

    /// Drive the full pipeline for one source, returning the collected
    /// output in frame order.
    fn run(&mut self, mut source: TemplateSource, ctx: &Context) -> TemplateList {
        let stage_count = self.transforms.len();
        let pool = FramePool::new(self.max_frames.max(1) as usize);
        let buffers: Vec<DoubleBuffer<Frame>> =
            (0..=stage_count).map(|_| DoubleBuffer::new()).collect();

        // Every buffer expects input before any worker starts.
        for buffer in &buffers {
            buffer.start_input();
        }

        let collected = std::thread::scope(|scope| {
            let mut workers = Vec::with_capacity(stage_count);
            for (index, transform) in self.transforms.iter_mut().enumerate() {
                let input = &buffers[index];
                let output = &buffers[index + 1];
                workers.push(scope.spawn(move || {
                    while let Some(mut frame) = input.get_item() {
                        transform.project_update(&mut frame.data, ctx);
                        output.add_item(frame);
                    }
                }));
            }

            let collector = {
                let input = &buffers[stage_count];
                let pool = &pool;
                scope.spawn(move || {
                    let mut collected = TemplateList::new();
                    while let Some(mut frame) = input.get_item() {
                        collected.0.append(&mut frame.data.0);
                        pool.give_back(frame);
                    }
                    collected
                })
            };

            // The read stage runs on the caller's own thread. Checking out
            // a frame blocks once pool-capacity frames are in flight.
            while let Some(mut frame) = pool.checkout() {
                if !source.next_frame(&mut frame) {
                    pool.give_back(frame);
                    break;
                }
                buffers[0].add_item(frame);
            }
            source.close();

            // Strict shutdown order: stop buffer i, wait for stage i to
            // drain and exit, then move downstream. No buffer learns "no
            // more input" while its upstream stage could still enqueue.
            for (index, worker) in workers.into_iter().enumerate() {
                buffers[index].stopped_input();
                if worker.join().is_err() {
                    warn!(stage = index, "processing stage panicked");
                }
            }
            buffers[stage_count].stopped_input();
            match collector.join() {
                Ok(collected) => collected,
                Err(_) => {
                    warn!("collection stage panicked");
                    TemplateList::new()
                }
            }
        });
        self.last_peak_in_flight = pool.peak_in_flight();
        collected
    }
}

impl Default for StreamTransform {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Parameterized for StreamTransform {
    fn type_name(&self) -> &'static str {
        "Stream"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[
            ParamDesc::arg("transforms", ParamKind::TransformList),
            ParamDesc::arg("maxFrames", ParamKind::Int),
        ];
        DESCS
    }

    fn get_param(&self, name: &str) -> Option<ParamValue> {
        match name {
            "maxFrames" => Some(ParamValue::Int(self.max_frames)),
            _ => None,
        }
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("transforms", ParamValue::TransformList(list)) => {
                self.transforms = list;
                Ok(())
            }
            ("maxFrames", ParamValue::Int(v)) => {
                self.max_frames = v;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "Stream".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for StreamTransform {
    fn trainable(&self) -> bool {
        self.transforms.iter().any(|t| t.trainable())
    }

    fn time_varying(&self) -> bool {
        true
    }

    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        for transform in &mut self.transforms {
            transform.train(data, ctx)?;
        }
        Ok(())
    }

    /// Streams are driven frame by frame through `project_update`.
    fn project(&self, _src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        Err(ProcessError::Other(
            "stream transforms process frame sequences, not single templates".to_string(),
        ))
    }

    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        if data.len() != 1 {
            warn!(
                templates = data.len(),
                "stream expects a single template input"
            );
            return;
        }
        let source = match open_source(&data[0], ctx) {
            Ok(source) => source,
            Err(e) => {
                warn!(
                    file = %data[0].record.flat(),
                    error = %e,
                    "failed to open stream source"
                );
                data[0].record.set_flag(FAILED_OPEN, true);
                return;
            }
        };
        *data = self.run(source, ctx);
    }

    fn description(&self) -> String {
        let parts: Vec<String> = self.transforms.iter().map(|t| t.description()).collect();
        format!("Stream([{}],maxFrames={})", parts.join(","), self.max_frames)
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        let children: Result<Vec<_>, _> =
            self.transforms.iter().map(|t| t.clone_boxed(ctx)).collect();
        let mut clone = StreamTransform::new(children?);
        clone.max_frames = self.max_frames;
        Ok(Box::new(clone))
    }

    fn store(&self) -> serde_json::Value {
        serde_json::Value::Array(self.transforms.iter().map(|t| t.store()).collect())
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        if let serde_json::Value::Array(states) = stored {
            for (transform, state) in self.transforms.iter_mut().zip(states) {
                transform.load(state, ctx)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use template_pipeline_common::{Mat, Record, Value};

    fn source_template(frames: usize) -> Template {
        let mut template = Template::new(Record::new("sequence"));
        for i in 0..frames {
            template.channels.push(Mat::from_elem((1, 1), i as f32));
        }
        template
    }

    /// Stamps each frame with a per-stage running counter, so output order
    /// and statefulness are observable.
    struct Sequencer {
        stage: &'static str,
        seen: i64,
    }

    impl Parameterized for Sequencer {
        fn type_name(&self) -> &'static str {
            "Sequencer"
        }
    }

    impl Transform for Sequencer {
        fn time_varying(&self) -> bool {
            true
        }

        fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
            Ok(src.clone())
        }

        fn project_update(&mut self, data: &mut TemplateList, _ctx: &Context) {
            for template in data.0.iter_mut() {
                template.record.set(self.stage, Value::Int(self.seen));
                self.seen += 1;
            }
        }
    }

    #[test]
    fn test_frame_pool_checkout_return() {
        let pool = FramePool::new(2);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_eq!(pool.in_flight(), 2);
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.peak_in_flight(), 2);
    }

    #[test]
    fn test_template_source_yields_channels_in_order() {
        let mut source = TemplateSource::new(source_template(3));
        let mut sequences = Vec::new();
        loop {
            let mut frame = Frame::default();
            if !source.next_frame(&mut frame) {
                break;
            }
            sequences.push(frame.sequence);
            assert_eq!(frame.data.len(), 1);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_stream_preserves_order_with_small_pool() {
        let frames = 50usize;
        let capacity = 4usize;
        let ctx = Context::initialized();
        let mut stream = StreamTransform::with_pool_capacity(
            vec![
                Box::new(Sequencer { stage: "s1", seen: 0 }),
                Box::new(Sequencer { stage: "s2", seen: 0 }),
                Box::new(Sequencer { stage: "s3", seen: 0 }),
            ],
            capacity,
        );

        let mut data: TemplateList = vec![source_template(frames)].into();
        stream.project_update(&mut data, &ctx);

        // All frames arrive, in original sequence order, at every stage.
        assert_eq!(data.len(), frames);
        for (i, template) in data.iter().enumerate() {
            assert_eq!(template.channels[0][[0, 0]], i as f32);
            for stage in ["s1", "s2", "s3"] {
                assert_eq!(template.record.get_int(stage).unwrap(), i as i64);
            }
        }
        // The pool capacity bounded the frames in flight.
        assert!(stream.last_peak_in_flight() <= capacity);
        assert!(stream.last_peak_in_flight() > 0);
    }

    #[test]
    fn test_stream_backpressure_bounds_in_flight_frames() {
        let frames = 60usize;
        let capacity = 3usize;

        let pool = FramePool::new(capacity);
        let mut source = TemplateSource::new(source_template(frames));
        let buffer = DoubleBuffer::new();
        buffer.start_input();

        std::thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                let mut collected = 0usize;
                while let Some(frame) = buffer.get_item() {
                    // A slow consumer forces the reader into the pool's
                    // backpressure path.
                    std::thread::sleep(std::time::Duration::from_micros(200));
                    pool.give_back(frame);
                    collected += 1;
                }
                collected
            });

            while let Some(mut frame) = pool.checkout() {
                if !source.next_frame(&mut frame) {
                    pool.give_back(frame);
                    break;
                }
                buffer.add_item(frame);
            }
            buffer.stopped_input();
            assert_eq!(consumer.join().unwrap(), frames);
        });

        assert_eq!(pool.in_flight(), 0);
        assert!(
            pool.peak_in_flight() <= capacity,
            "peak {} exceeded capacity {capacity}",
            pool.peak_in_flight()
        );
    }

    #[test]
    fn test_stream_flags_unopenable_sources() {
        let ctx = Context::initialized();
        let mut stream = StreamTransform::new(vec![]);
        let mut data: TemplateList = vec![Template::new(Record::new("missing.raw"))].into();
        stream.project_update(&mut data, &ctx);
        assert!(data[0].record.get_flag(FAILED_OPEN));
    }

    #[test]
    fn test_stream_via_description() {
        let ctx = Context::initialized();
        let mut stream =
            crate::describe::transform_from("Stream([Identity,Discard],maxFrames=8)", &ctx)
                .unwrap();
        assert!(stream.time_varying());

        let mut data: TemplateList = vec![source_template(10)].into();
        stream.project_update(&mut data, &ctx);
        assert_eq!(data.len(), 10);
        // Discard dropped every frame's channels but kept metadata.
        assert!(data.iter().all(|t| t.is_empty()));
    }
}
