//! The Distance execution contract: admission filtering, single comparison,
//! and tiled cross-product dispatch

use crate::context::Context;
use crate::output::Output;
use crate::params::Parameterized;
use template_pipeline_common::{Template, TemplateList};
use tracing::warn;

/// Reserved score for comparisons rejected by an admission filter: the
/// minimum representable score.
pub const REJECTED: f32 = f32::MIN;

/// A unit computing a similarity score between two templates, with
/// matrix-scale batch comparison support.
pub trait Distance: Parameterized + Send + Sync {
    /// The implementation-specific comparison. Only invoked after the
    /// admission filters pass.
    fn metric(&self, target: &Template, query: &Template) -> f32;

    /// Compare two templates. Each configured admission filter is a regex
    /// matched against the named metadata field of the target; any
    /// non-match short-circuits to the rejected sentinel without invoking
    /// the metric.
    fn compare(&self, target: &Template, query: &Template, ctx: &Context) -> f32 {
        if !ctx.filters.is_empty() {
            for (field, pattern) in &ctx.filters {
                let value = target.record.get_str_or(field, "");
                if value.is_empty() {
                    continue;
                }
                if !pattern.is_match(value) {
                    return REJECTED;
                }
            }
        }
        self.metric(target, query)
    }

    /// Full cross product of scores written through the output sink. The
    /// larger list is split into contiguous blocks sized so the block count
    /// approximates the parallelism degree; each block writes its scores at
    /// the correct (row, column) offsets, so no two blocks overlap and the
    /// sink needs no per-cell locking.
    fn compare_lists(
        &self,
        targets: &TemplateList,
        queries: &TemplateList,
        output: &dyn Output,
        ctx: &Context,
    ) {
        if targets.is_empty() || queries.is_empty() {
            return;
        }
        let step_target = targets.len() > queries.len();
        let total = targets.len().max(queries.len());
        let step = total.div_ceil(ctx.parallelism().max(1));

        if ctx.parallelism() == 0 {
            for start in (0..total).step_by(step) {
                let end = (start + step).min(total);
                self.compare_block(targets, queries, output, start..end, step_target, ctx);
            }
            return;
        }

        ctx.pool().scope(|scope| {
            for start in (0..total).step_by(step) {
                let end = (start + step).min(total);
                scope.spawn(move |_| {
                    self.compare_block(targets, queries, output, start..end, step_target, ctx);
                });
            }
        });
    }

    /// Compare one block of the cross product, slicing whichever list was
    /// recorded as stepped and offsetting writes on that axis.
    fn compare_block(
        &self,
        targets: &TemplateList,
        queries: &TemplateList,
        output: &dyn Output,
        range: std::ops::Range<usize>,
        step_target: bool,
        ctx: &Context,
    ) {
        let (target_slice, query_slice, target_offset, query_offset) = if step_target {
            (&targets.0[range.clone()], &queries.0[..], range.start, 0)
        } else {
            (&targets.0[..], &queries.0[range.clone()], 0, range.start)
        };
        for (i, query) in query_slice.iter().enumerate() {
            for (j, target) in target_slice.iter().enumerate() {
                output.set_relative(
                    self.compare(target, query, ctx),
                    i + query_offset,
                    j + target_offset,
                );
            }
        }
    }

    /// Per-element comparison against one query; sequential, used by
    /// iterative algorithms on small lists.
    fn compare_against(&self, targets: &TemplateList, query: &Template, ctx: &Context) -> Vec<f32> {
        targets
            .iter()
            .map(|target| self.compare(target, query, ctx))
            .collect()
    }

    /// The description string this instance was built from.
    fn description(&self) -> String {
        let args = crate::params::render_arguments(self);
        if args.is_empty() {
            self.type_name().to_string()
        } else {
            format!("{}({})", self.type_name(), args)
        }
    }
}

fn single_mats<'a>(target: &'a Template, query: &'a Template) -> Option<(&'a template_pipeline_common::Mat, &'a template_pipeline_common::Mat)> {
    match (target.mat(), query.mat()) {
        (Ok(t), Ok(q)) if t.dim() == q.dim() => Some((t, q)),
        _ => {
            warn!(
                target = %target.record.flat(),
                query = %query.record.flat(),
                "incomparable templates"
            );
            None
        }
    }
}

/// Negated L1 (taxicab) distance over single-matrix templates; larger is
/// more similar.
pub struct L1Distance;

impl Parameterized for L1Distance {
    fn type_name(&self) -> &'static str {
        "L1"
    }
}

impl Distance for L1Distance {
    fn metric(&self, target: &Template, query: &Template) -> f32 {
        match single_mats(target, query) {
            Some((t, q)) => {
                let sum: f32 = t.iter().zip(q.iter()).map(|(a, b)| (a - b).abs()).sum();
                -sum
            }
            None => REJECTED,
        }
    }
}

/// Negated Euclidean distance over single-matrix templates.
pub struct L2Distance;

impl Parameterized for L2Distance {
    fn type_name(&self) -> &'static str {
        "L2"
    }
}

impl Distance for L2Distance {
    fn metric(&self, target: &Template, query: &Template) -> f32 {
        match single_mats(target, query) {
            Some((t, q)) => {
                let sum: f32 = t.iter().zip(q.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                -sum.sqrt()
            }
            None => REJECTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MatrixOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use template_pipeline_common::{Mat, Record, Value};

    fn template(name: &str, value: f32) -> Template {
        Template::with_channel(Record::new(name), Mat::from_elem((1, 4), value))
    }

    #[test]
    fn test_l1_and_l2() {
        let t = template("t", 1.0);
        let q = template("q", 3.0);
        assert_eq!(L1Distance.metric(&t, &q), -8.0);
        assert_eq!(L2Distance.metric(&t, &q), -4.0);
    }

    /// Records whether the wrapped comparison was invoked.
    struct Recording {
        calls: AtomicUsize,
    }

    impl Parameterized for Recording {
        fn type_name(&self) -> &'static str {
            "Recording"
        }
    }

    impl Distance for Recording {
        fn metric(&self, _target: &Template, _query: &Template) -> f32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            1.0
        }
    }

    #[test]
    fn test_rejection_sentinel_skips_the_metric() {
        let mut ctx = Context::initialized();
        ctx.add_filter("Gender", "^female$").unwrap();

        let distance = Recording {
            calls: AtomicUsize::new(0),
        };
        let mut target = template("t", 1.0);
        target.record.set("Gender", Value::Str("male".to_string()));
        let query = template("q", 1.0);

        assert_eq!(distance.compare(&target, &query, &ctx), REJECTED);
        assert_eq!(distance.calls.load(Ordering::SeqCst), 0);

        target.record.set("Gender", Value::Str("female".to_string()));
        assert_eq!(distance.compare(&target, &query, &ctx), 1.0);
        assert_eq!(distance.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_absent_filter_field_admits() {
        let mut ctx = Context::initialized();
        ctx.add_filter("Gender", "^female$").unwrap();
        let distance = Recording {
            calls: AtomicUsize::new(0),
        };
        // No Gender key on the target: the filter does not apply.
        assert_eq!(distance.compare(&template("t", 1.0), &template("q", 1.0), &ctx), 1.0);
    }

    fn cross_product_matrix(
        parallelism: usize,
        n_targets: usize,
        n_queries: usize,
    ) -> MatrixOutput {
        let mut ctx = Context::initialized();
        ctx.set_parallelism(parallelism);
        let targets: TemplateList = (0..n_targets)
            .map(|i| template(&format!("t{i}"), i as f32))
            .collect();
        let queries: TemplateList = (0..n_queries)
            .map(|i| template(&format!("q{i}"), i as f32))
            .collect();
        let mut output = MatrixOutput::default();
        output.initialize(
            &targets.iter().map(|t| t.record.clone()).collect::<Vec<_>>(),
            &queries.iter().map(|t| t.record.clone()).collect::<Vec<_>>(),
        );
        L1Distance.compare_lists(&targets, &queries, &output, &ctx);
        output
    }

    #[test]
    fn test_tiled_compare_matches_sequential() {
        // Slice the target axis (more targets), then the query axis.
        for (n_targets, n_queries) in [(13, 4), (4, 13)] {
            let sequential = cross_product_matrix(0, n_targets, n_queries);
            let tiled = cross_product_matrix(4, n_targets, n_queries);
            for row in 0..n_queries {
                for col in 0..n_targets {
                    let expected = 4.0 * -((row as f32 - col as f32).abs());
                    assert_eq!(sequential.get(row, col), expected);
                    assert_eq!(tiled.get(row, col), expected);
                }
            }
        }
    }
}
