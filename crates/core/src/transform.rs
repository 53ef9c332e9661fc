//! The Transform execution contract: train, project, batch dispatch with
//! failure containment, and the stratified downsampling applied to training
//! data

use crate::context::Context;
use crate::params::{load_params, render_arguments, store_params, ParamDesc, ParamKind, ParamValue, Parameterized};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::panic::AssertUnwindSafe;
use template_pipeline_common::{ConfigError, ProcessError, Template, TemplateList};
use tracing::warn;

/// Downsampling configuration carried by trainable transforms and copied by
/// `clone_boxed`. `instances < 0` selects "at least" semantics: classes with
/// fewer than `|instances|` elements are dropped, the rest keep everything.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub relabel: bool,
    pub classes: i64,
    pub instances: i64,
    pub fraction: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            relabel: false,
            classes: i64::MAX,
            instances: i64::MAX,
            fraction: 1.0,
        }
    }
}

/// Descriptor table fragment shared by every trainable transform.
pub const SAMPLING_DESCRIPTORS: [ParamDesc; 4] = [
    ParamDesc::arg("relabel", ParamKind::Bool),
    ParamDesc::arg("classes", ParamKind::Int),
    ParamDesc::arg("instances", ParamKind::Int),
    ParamDesc::arg("fraction", ParamKind::Float),
];

impl SamplingParams {
    pub fn is_noop(&self) -> bool {
        self.classes == i64::MAX && self.instances == i64::MAX && self.fraction >= 1.0
    }

    pub fn is_param(name: &str) -> bool {
        matches!(name, "relabel" | "classes" | "instances" | "fraction")
    }

    pub fn get_param(&self, name: &str) -> Option<ParamValue> {
        match name {
            "relabel" => Some(ParamValue::Bool(self.relabel)),
            "classes" => Some(ParamValue::Int(self.classes)),
            "instances" => Some(ParamValue::Int(self.instances)),
            "fraction" => Some(ParamValue::Float(self.fraction)),
            _ => None,
        }
    }

    pub fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("relabel", ParamValue::Bool(v)) => self.relabel = v,
            ("classes", ParamValue::Int(v)) => self.classes = v,
            ("instances", ParamValue::Int(v)) => self.instances = v,
            ("fraction", ParamValue::Float(v)) => self.fraction = v,
            (name, value) => {
                return Err(ConfigError::InvalidParameter {
                    name: name.to_string(),
                    value: value.render(),
                    expected: "sampling parameter",
                })
            }
        }
        Ok(())
    }
}

/// A trainable-or-not, composable unit mapping Template to Template.
pub trait Transform: Parameterized + Send + Sync {
    /// Whether `train` mutates internal parameters. Untrainable transforms
    /// treat `train` as a no-op.
    fn trainable(&self) -> bool {
        false
    }

    /// Whether this transform must be cloned per data channel rather than
    /// shared. Independent transforms are wrapped by the resolver.
    fn independent(&self) -> bool {
        false
    }

    /// Whether projection carries state across stream frames.
    fn time_varying(&self) -> bool {
        false
    }

    fn sampling(&self) -> SamplingParams {
        SamplingParams::default()
    }

    fn set_sampling(&mut self, _params: SamplingParams) {}

    fn train(&mut self, _data: &TemplateList, _ctx: &Context) -> Result<(), ProcessError> {
        Ok(())
    }

    /// Project one element. Pure and deterministic given internal state.
    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError>;

    /// Inverse projection; identity by default.
    fn back_project(&self, dst: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        Ok(dst.clone())
    }

    /// Batch dispatch: projects every element, concurrently when the context
    /// parallelism degree is nonzero. Output slot i always corresponds to
    /// input slot i regardless of completion order. A per-item error or
    /// panic is contained at this boundary and becomes an empty template
    /// carrying the input's metadata with the failed-to-enroll flag set.
    fn project_list(&self, src: &TemplateList, ctx: &Context) -> TemplateList {
        let run = |t: &Template| -> Template {
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.project(t, ctx))) {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    warn!(
                        transform = self.type_name(),
                        item = %t.record.flat(),
                        error = %e,
                        "projection failed"
                    );
                    Template::failed(t.record.clone())
                }
                Err(_) => {
                    warn!(
                        transform = self.type_name(),
                        item = %t.record.flat(),
                        "projection panicked"
                    );
                    Template::failed(t.record.clone())
                }
            }
        };
        if ctx.parallelism() == 0 {
            src.iter().map(run).collect()
        } else {
            TemplateList(ctx.pool().install(|| src.0.par_iter().map(run).collect()))
        }
    }

    /// Batch inverse dispatch with the same containment pattern.
    fn back_project_list(&self, dst: &TemplateList, ctx: &Context) -> TemplateList {
        let run = |t: &Template| -> Template {
            match std::panic::catch_unwind(AssertUnwindSafe(|| self.back_project(t, ctx))) {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    warn!(
                        transform = self.type_name(),
                        item = %t.record.flat(),
                        error = %e,
                        "back projection failed"
                    );
                    Template::failed(t.record.clone())
                }
                Err(_) => {
                    warn!(
                        transform = self.type_name(),
                        item = %t.record.flat(),
                        "back projection panicked"
                    );
                    Template::failed(t.record.clone())
                }
            }
        };
        if ctx.parallelism() == 0 {
            dst.iter().map(run).collect()
        } else {
            TemplateList(ctx.pool().install(|| dst.0.par_iter().map(run).collect()))
        }
    }

    /// Streaming-update projection, applied to a frame's payload in place.
    /// Stateless transforms get the contained per-item default; time-varying
    /// transforms override to carry state between frames.
    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        for slot in data.0.iter_mut() {
            let out = match std::panic::catch_unwind(AssertUnwindSafe(|| self.project(slot, ctx)))
            {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    warn!(
                        transform = self.type_name(),
                        item = %slot.record.flat(),
                        error = %e,
                        "stream projection failed"
                    );
                    Template::failed(slot.record.clone())
                }
                Err(_) => {
                    warn!(
                        transform = self.type_name(),
                        item = %slot.record.flat(),
                        "stream projection panicked"
                    );
                    Template::failed(slot.record.clone())
                }
            };
            *slot = out;
        }
    }

    /// The description string this instance was (or could be) built from.
    fn description(&self) -> String {
        let args = render_arguments(self);
        if args.is_empty() {
            self.type_name().to_string()
        } else {
            format!("{}({})", self.type_name(), args)
        }
    }

    /// A fresh untrained instance reconstructed from this instance's
    /// description, carrying over the downsampling configuration but not
    /// trained state.
    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        let mut clone = crate::describe::transform_from(&self.description(), ctx)?;
        clone.set_sampling(self.sampling());
        Ok(clone)
    }

    /// Serialize trained state. The default covers stored scalar
    /// descriptors; transforms holding matrices or children override.
    fn store(&self) -> serde_json::Value {
        store_params(self)
    }

    /// Restore state serialized by `store`.
    fn load(&mut self, stored: &serde_json::Value, _ctx: &Context) -> Result<(), ConfigError> {
        load_params(self, stored)
    }
}

/// Stratified subsampling of a training collection. Class and instance
/// selection are randomized but reproducible for a given context seed;
/// elements flagged as prior failures are never selected.
pub fn downsample(data: &TemplateList, params: &SamplingParams, ctx: &Context) -> TemplateList {
    if params.is_noop() {
        return data.clone();
    }

    let at_least = params.instances < 0;
    let instances = params.instances.unsigned_abs() as usize;
    let instance_limited = params.instances != i64::MAX;

    let all_labels: Vec<i32> = data
        .labels(&ctx.labels)
        .into_iter()
        .map(|l| l as i32)
        .collect();

    let mut counts = data.label_counts(&ctx.labels, instance_limited);
    if instance_limited && params.classes != i64::MAX {
        counts.retain(|_, &mut count| count >= instances);
    }
    let mut unique_labels: Vec<i32> = counts.keys().copied().collect();
    if params.classes != i64::MAX && (unique_labels.len() as i64) < params.classes {
        warn!(
            requested = params.classes,
            available = unique_labels.len(),
            "downsample requested more classes than are available"
        );
    }

    let mut rng = StdRng::seed_from_u64(ctx.seed);

    if (params.classes as usize) < unique_labels.len() {
        unique_labels.shuffle(&mut rng);
        unique_labels.truncate(params.classes as usize);
    }

    let mut selected = TemplateList::new();
    for (new_label, &label) in unique_labels.iter().enumerate() {
        let mut indices: Vec<usize> = (0..all_labels.len())
            .filter(|&i| all_labels[i] == label && !data[i].record.failed())
            .collect();
        indices.shuffle(&mut rng);
        let keep = if at_least {
            indices.len()
        } else {
            indices.len().min(instances)
        };
        for &index in &indices[..keep] {
            let mut template = data[index].clone();
            if params.relabel {
                template.record.set(
                    template_pipeline_common::LABEL,
                    template_pipeline_common::Value::Int(new_label as i64),
                );
            }
            selected.push(template);
        }
    }

    if params.fraction < 1.0 {
        selected.0.shuffle(&mut rng);
        let keep = (selected.len() as f64 * params.fraction) as usize;
        selected.0.truncate(keep);
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use template_pipeline_common::{Mat, Record, Value, LABEL};

    /// Projects after an artificial per-item delay taken from metadata.
    struct Stagger;

    impl Parameterized for Stagger {
        fn type_name(&self) -> &'static str {
            "Stagger"
        }
    }

    impl Transform for Stagger {
        fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
            let delay = src.record.get_int_or("delayMs", 0) as u64;
            std::thread::sleep(std::time::Duration::from_millis(delay));
            let mut out = src.clone();
            out.record.set("projected", Value::Str(src.record.name.clone()));
            Ok(out)
        }
    }

    /// Fails for exactly one crafted input name.
    struct FailOn;

    impl Parameterized for FailOn {
        fn type_name(&self) -> &'static str {
            "FailOn"
        }
    }

    impl Transform for FailOn {
        fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
            if src.record.name == "poison" {
                return Err(ProcessError::Other("crafted failure".to_string()));
            }
            Ok(src.clone())
        }
    }

    /// Panics instead of erroring, to exercise the panic containment path.
    struct PanicOn;

    impl Parameterized for PanicOn {
        fn type_name(&self) -> &'static str {
            "PanicOn"
        }
    }

    impl Transform for PanicOn {
        fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
            assert_ne!(src.record.name, "poison", "crafted panic");
            Ok(src.clone())
        }
    }

    fn collection(n: usize) -> TemplateList {
        (0..n)
            .map(|i| {
                let mut record = Record::new(format!("item-{i}"));
                // Later items finish first under parallel dispatch.
                record.set("delayMs", Value::Int(((n - i) % 4) as i64 * 5));
                Template::with_channel(record, Mat::from_elem((1, 1), i as f32))
            })
            .collect()
    }

    #[test]
    fn test_batch_order_invariance_across_parallelism() {
        let transform = Stagger;
        let src = collection(8);
        for parallelism in 0..=8 {
            let mut ctx = Context::new();
            ctx.set_parallelism(parallelism);
            let dst = transform.project_list(&src, &ctx);
            assert_eq!(dst.len(), src.len());
            for (i, out) in dst.iter().enumerate() {
                let isolated = transform.project(&src[i], &ctx).unwrap();
                assert_eq!(out, &isolated, "slot {i} at parallelism {parallelism}");
            }
        }
    }

    #[test]
    fn test_per_item_failure_containment() {
        let transform = FailOn;
        let mut src = collection(5);
        src[2].record.name = "poison".to_string();
        for parallelism in [0, 4] {
            let mut ctx = Context::new();
            ctx.set_parallelism(parallelism);
            let dst = transform.project_list(&src, &ctx);
            assert_eq!(dst.len(), 5);
            assert!(dst[2].is_empty());
            assert!(dst[2].record.get_flag(template_pipeline_common::FAILED_ENROLL));
            assert_eq!(dst[2].record.name, "poison");
            for i in [0usize, 1, 3, 4] {
                assert!(!dst[i].record.failed());
                assert_eq!(dst[i], src[i]);
            }
        }
    }

    #[test]
    fn test_panic_containment() {
        let transform = PanicOn;
        let mut src = collection(3);
        src[1].record.name = "poison".to_string();
        let mut ctx = Context::new();
        ctx.set_parallelism(2);
        let dst = transform.project_list(&src, &ctx);
        assert_eq!(dst.len(), 3);
        assert!(dst[1].record.get_flag(template_pipeline_common::FAILED_ENROLL));
        assert!(!dst[0].record.failed());
        assert!(!dst[2].record.failed());
    }

    #[test]
    fn test_back_project_defaults_to_identity() {
        let transform = Stagger;
        let ctx = Context::new();
        let src = collection(3);
        let dst = transform.back_project_list(&src, &ctx);
        assert_eq!(dst.0, src.0);
    }

    fn labeled_collection() -> TemplateList {
        let mut list = TemplateList::new();
        for label in ["a", "b", "c", "d"] {
            let count = match label {
                "a" => 5,
                "b" => 4,
                "c" => 2,
                _ => 1,
            };
            for i in 0..count {
                let mut record = Record::new(format!("{label}-{i}"));
                record.set(LABEL, Value::Str(label.to_string()));
                list.push(Template::with_channel(record, Mat::zeros((1, 1))));
            }
        }
        list
    }

    #[test]
    fn test_downsample_deterministic_under_fixed_seed() {
        let data = labeled_collection();
        let params = SamplingParams {
            classes: 2,
            instances: 2,
            ..SamplingParams::default()
        };
        let mut ctx = Context::new();
        ctx.seed = 7;
        let first = downsample(&data, &params, &ctx);
        let second = downsample(&data, &params, &ctx);
        let names = |list: &TemplateList| -> Vec<String> {
            list.iter().map(|t| t.record.name.clone()).collect()
        };
        assert_eq!(names(&first), names(&second));

        ctx.seed = 8;
        let third = downsample(&data, &params, &ctx);
        // Caps hold regardless of seed.
        for list in [&first, &third] {
            let counts = list.label_counts(&ctx.labels, false);
            assert!(counts.len() <= 2);
            assert!(counts.values().all(|&c| c <= 2));
        }
    }

    #[test]
    fn test_downsample_at_least_semantics() {
        let data = labeled_collection();
        let params = SamplingParams {
            classes: 2,
            instances: -4,
            ..SamplingParams::default()
        };
        let ctx = Context::new();
        let selected = downsample(&data, &params, &ctx);
        let counts = selected.label_counts(&ctx.labels, false);
        // Only labels with at least 4 instances survive, and they keep all
        // their instances.
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|&c| c >= 4));
    }

    #[test]
    fn test_downsample_skips_failures() {
        let mut data = labeled_collection();
        for template in data.0.iter_mut() {
            if template.record.get_str_or(LABEL, "") == "a" {
                template.record.set_flag(template_pipeline_common::FAILED_ENROLL, true);
            }
        }
        let params = SamplingParams {
            instances: 10,
            ..SamplingParams::default()
        };
        let ctx = Context::new();
        let selected = downsample(&data, &params, &ctx);
        assert!(selected.iter().all(|t| !t.record.failed()));
    }

    #[test]
    fn test_downsample_fraction() {
        let data = labeled_collection();
        let params = SamplingParams {
            fraction: 0.5,
            ..SamplingParams::default()
        };
        let ctx = Context::new();
        let selected = downsample(&data, &params, &ctx);
        assert_eq!(selected.len(), data.len() / 2);
    }
}
