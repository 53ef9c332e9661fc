//! Built-in meta transforms: channel plumbing, source materialization, and a
//! reference trainable transform

use crate::context::Context;
use crate::params::{ParamDesc, ParamValue, Parameterized};
use crate::transform::{SamplingParams, Transform, SAMPLING_DESCRIPTORS};
use serde_json::json;
use template_pipeline_common::{
    ConfigError, Mat, ProcessError, Template, FAILED_OPEN,
};
use tracing::{debug, warn};

/// A no-op transform.
pub struct Identity;

impl Parameterized for Identity {
    fn type_name(&self) -> &'static str {
        "Identity"
    }
}

impl Transform for Identity {
    fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        Ok(src.clone())
    }
}

/// Removes all of a template's channels, keeping the metadata record.
pub struct Discard;

impl Parameterized for Discard {
    fn type_name(&self) -> &'static str {
        "Discard"
    }
}

impl Transform for Discard {
    fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        Ok(Template::new(src.record.clone()))
    }
}

/// Keeps only the first channel.
pub struct First;

impl Parameterized for First {
    fn type_name(&self) -> &'static str {
        "First"
    }
}

impl Transform for First {
    fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        let first = src
            .channels
            .first()
            .ok_or(ProcessError::ChannelCount {
                expected: 1,
                actual: 0,
            })?
            .clone();
        Ok(Template::with_channel(src.record.clone(), first))
    }
}

/// Removes the first channel.
pub struct Rest;

impl Parameterized for Rest {
    fn type_name(&self) -> &'static str {
        "Rest"
    }
}

impl Transform for Rest {
    fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        let mut out = src.clone();
        if !out.channels.is_empty() {
            out.channels.remove(0);
        }
        Ok(out)
    }
}

/// Materializes a record's file through the format registry and appends the
/// decoded channels. Elements that cannot be opened are flagged rather than
/// failing the batch.
pub struct Open;

impl Parameterized for Open {
    fn type_name(&self) -> &'static str {
        "Open"
    }
}

impl Transform for Open {
    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        if !src.is_empty() {
            return Ok(src.clone());
        }
        if ctx.verbose {
            debug!(file = %src.record.flat(), "opening");
        }

        let mut dst = Template::new(src.record.clone());
        let extension = std::path::Path::new(&src.record.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match ctx.formats.make(&extension, &[], ctx) {
            Ok(format) => match format.read(&src.record) {
                Ok(read) => {
                    dst.record.append(&read.record);
                    dst.channels.extend(read.channels);
                }
                Err(e) => {
                    warn!(file = %src.record.flat(), error = %e, "failed to open");
                }
            },
            Err(e) => {
                warn!(file = %src.record.flat(), error = %e, "no format for file");
            }
        }

        dst.record.set_flag(FAILED_OPEN, dst.is_empty());
        Ok(dst)
    }
}

/// Subtracts the per-channel training mean. Trainable and independent: one
/// clone per channel learns that channel's own mean.
#[derive(Default)]
pub struct Center {
    mean: Option<Mat>,
    sampling: SamplingParams,
}

impl Parameterized for Center {
    fn type_name(&self) -> &'static str {
        "Center"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        &SAMPLING_DESCRIPTORS
    }

    fn get_param(&self, name: &str) -> Option<ParamValue> {
        self.sampling.get_param(name)
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        if SamplingParams::is_param(name) {
            self.sampling.set_param(name, value)
        } else {
            Err(ConfigError::UnknownParameter {
                type_name: "Center".to_string(),
                name: name.to_string(),
            })
        }
    }
}

impl Transform for Center {
    fn trainable(&self) -> bool {
        true
    }

    fn independent(&self) -> bool {
        true
    }

    fn sampling(&self) -> SamplingParams {
        self.sampling
    }

    fn set_sampling(&mut self, params: SamplingParams) {
        self.sampling = params;
    }

    fn train(
        &mut self,
        data: &template_pipeline_common::TemplateList,
        _ctx: &Context,
    ) -> Result<(), ProcessError> {
        let mut sum: Option<Mat> = None;
        let mut count = 0usize;
        for template in data {
            if template.record.failed() {
                continue;
            }
            let mat = template.mat()?;
            match &mut sum {
                None => sum = Some(mat.clone()),
                Some(acc) => {
                    if acc.dim() != mat.dim() {
                        return Err(ProcessError::ShapeMismatch(format!(
                            "{:?} vs {:?}",
                            acc.dim(),
                            mat.dim()
                        )));
                    }
                    *acc += mat;
                }
            }
            count += 1;
        }
        self.mean = sum.map(|total| total / count as f32);
        Ok(())
    }

    fn project(&self, src: &Template, _ctx: &Context) -> Result<Template, ProcessError> {
        let mat = src.mat()?;
        let centered = match &self.mean {
            // Untrained centering passes data through unchanged.
            None => mat.clone(),
            Some(mean) => {
                if mean.dim() != mat.dim() {
                    return Err(ProcessError::ShapeMismatch(format!(
                        "{:?} vs {:?}",
                        mean.dim(),
                        mat.dim()
                    )));
                }
                mat - mean
            }
        };
        Ok(Template::with_channel(src.record.clone(), centered))
    }

    fn store(&self) -> serde_json::Value {
        match &self.mean {
            None => json!({ "mean": null }),
            Some(mean) => json!({
                "mean": {
                    "rows": mean.nrows(),
                    "cols": mean.ncols(),
                    "data": mean.iter().copied().collect::<Vec<f32>>(),
                }
            }),
        }
    }

    fn load(&mut self, stored: &serde_json::Value, _ctx: &Context) -> Result<(), ConfigError> {
        let mean = match stored.get("mean") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let rows = value.get("rows").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let cols = value.get("cols").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let data: Vec<f32> = value
                    .get("data")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(
                    Mat::from_shape_vec((rows, cols), data).map_err(|e| {
                        ConfigError::Malformed {
                            fragment: "stored mean".to_string(),
                            reason: e.to_string(),
                        }
                    })?,
                )
            }
        };
        self.mean = mean;
        Ok(())
    }
}
