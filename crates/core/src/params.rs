//! Typed parameter descriptors and the generic store/load contract
//!
//! Registrable types expose an explicit descriptor table instead of runtime
//! reflection: each type lists its parameters as (name, kind, stored) and
//! dispatches get/set through a typed match. Serialization walks the table in
//! declaration order producing type-tagged values, so the on-disk layout is
//! stable across runs.

use crate::context::Context;
use crate::distance::Distance;
use crate::transform::Transform;
use serde_json::json;
use template_pipeline_common::{split_outside_brackets, ConfigError};

/// The closed set of parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    StrList,
    Transform,
    TransformList,
    Distance,
}

impl ParamKind {
    pub fn tag(self) -> &'static str {
        match self {
            ParamKind::Bool => "bool",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::StrList => "str_list",
            ParamKind::Transform => "transform",
            ParamKind::TransformList => "transform_list",
            ParamKind::Distance => "distance",
        }
    }
}

/// A typed parameter value in flight between a description argument, a
/// descriptor table entry, and the serialized form.
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
    Transform(Box<dyn Transform>),
    TransformList(Vec<Box<dyn Transform>>),
    Distance(Box<dyn Distance>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Str(_) => ParamKind::Str,
            ParamValue::StrList(_) => ParamKind::StrList,
            ParamValue::Transform(_) => ParamKind::Transform,
            ParamValue::TransformList(_) => ParamKind::TransformList,
            ParamValue::Distance(_) => ParamKind::Distance,
        }
    }

    /// Parse a description argument into a value of the requested kind.
    /// Transform-valued arguments are resolved recursively through the
    /// registries.
    pub fn parse(
        kind: ParamKind,
        name: &str,
        raw: &str,
        ctx: &Context,
    ) -> Result<ParamValue, ConfigError> {
        let raw = raw.trim();
        let invalid = |expected: &'static str| ConfigError::InvalidParameter {
            name: name.to_string(),
            value: raw.to_string(),
            expected,
        };
        match kind {
            ParamKind::Bool => match raw {
                // A bare key in a description reads as a set flag.
                "" | "true" => Ok(ParamValue::Bool(true)),
                "false" => Ok(ParamValue::Bool(false)),
                _ => Err(invalid("bool")),
            },
            ParamKind::Int => raw
                .parse()
                .map(ParamValue::Int)
                .map_err(|_| invalid("int")),
            ParamKind::Float => raw
                .parse()
                .map(ParamValue::Float)
                .map_err(|_| invalid("float")),
            ParamKind::Str => Ok(ParamValue::Str(raw.to_string())),
            ParamKind::StrList => Ok(ParamValue::StrList(
                strip_list(raw, name)?
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            ParamKind::Transform => Ok(ParamValue::Transform(crate::describe::transform_from(
                raw, ctx,
            )?)),
            ParamKind::TransformList => {
                let mut transforms = Vec::new();
                for part in strip_list(raw, name)? {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    transforms.push(crate::describe::transform_from(part, ctx)?);
                }
                Ok(ParamValue::TransformList(transforms))
            }
            ParamKind::Distance => Ok(ParamValue::Distance(crate::describe::distance_from(
                raw, ctx,
            )?)),
        }
    }

    /// Render a scalar value back into its description-argument form.
    pub fn render(&self) -> String {
        match self {
            ParamValue::Bool(v) => v.to_string(),
            ParamValue::Int(v) => v.to_string(),
            ParamValue::Float(v) => v.to_string(),
            ParamValue::Str(v) => v.clone(),
            ParamValue::StrList(v) => format!("[{}]", v.join(",")),
            ParamValue::Transform(t) => t.description(),
            ParamValue::TransformList(list) => {
                let parts: Vec<String> = list.iter().map(|t| t.description()).collect();
                format!("[{}]", parts.join(","))
            }
            ParamValue::Distance(d) => d.description(),
        }
    }
}

fn strip_list(raw: &str, name: &str) -> Result<Vec<String>, ConfigError> {
    if !raw.starts_with('[') || !raw.ends_with(']') {
        return Err(ConfigError::InvalidParameter {
            name: name.to_string(),
            value: raw.to_string(),
            expected: "bracketed list",
        });
    }
    Ok(split_outside_brackets(&raw[1..raw.len() - 1], ','))
}

/// One entry in a type's parameter descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct ParamDesc {
    pub name: &'static str,
    pub kind: ParamKind,
    /// Stored parameters participate in the default store/load walk;
    /// non-stored parameters are configuration reconstructed from the
    /// description string.
    pub stored: bool,
}

impl ParamDesc {
    pub const fn arg(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            stored: false,
        }
    }

    pub const fn stored(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            stored: true,
        }
    }
}

/// The typed-parameter contract every registrable object fulfills.
pub trait Parameterized {
    /// The registered type name.
    fn type_name(&self) -> &'static str;

    fn descriptors(&self) -> &'static [ParamDesc] {
        &[]
    }

    fn get_param(&self, _name: &str) -> Option<ParamValue> {
        None
    }

    fn set_param(&mut self, name: &str, _value: ParamValue) -> Result<(), ConfigError> {
        Err(ConfigError::UnknownParameter {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })
    }
}

/// Configure an object from a description's parsed argument list. Positional
/// arguments bind to descriptors in declaration order, `key=value` arguments
/// bind by name.
pub fn apply_arguments<T: Parameterized + ?Sized>(
    obj: &mut T,
    args: &[String],
    ctx: &Context,
) -> Result<(), ConfigError> {
    for (position, arg) in args.iter().enumerate() {
        let arg = arg.trim();
        if arg.is_empty() {
            continue;
        }
        let (name, raw) = match split_key_value(arg) {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => {
                let desc = obj.descriptors().get(position).ok_or_else(|| {
                    ConfigError::UnknownParameter {
                        type_name: obj.type_name().to_string(),
                        name: format!("positional argument {position}"),
                    }
                })?;
                (desc.name.to_string(), arg.to_string())
            }
        };
        let desc = obj
            .descriptors()
            .iter()
            .find(|d| d.name == name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownParameter {
                type_name: obj.type_name().to_string(),
                name: name.clone(),
            })?;
        let value = ParamValue::parse(desc.kind, &name, &raw, ctx)?;
        obj.set_param(&name, value)?;
    }
    Ok(())
}

/// Split `key=value` at the first top-level `=`. Returns `None` for purely
/// positional arguments.
fn split_key_value(arg: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    for (i, ch) in arg.char_indices() {
        match ch {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            '=' if depth == 0 => return Some((arg[..i].trim(), arg[i + 1..].trim())),
            _ => {}
        }
    }
    None
}

/// Render an object's configuration arguments (non-stored descriptors) as a
/// description argument list.
pub fn render_arguments<T: Parameterized + ?Sized>(obj: &T) -> String {
    let mut parts = Vec::new();
    for desc in obj.descriptors() {
        if desc.stored {
            continue;
        }
        if let Some(value) = obj.get_param(desc.name) {
            parts.push(format!("{}={}", desc.name, value.render()));
        }
    }
    parts.join(",")
}

/// Serialize the stored scalar parameters of an object in descriptor order.
/// Types holding child transforms or matrices as state override their own
/// store/load and delegate here for the scalar part.
pub fn store_params<T: Parameterized + ?Sized>(obj: &T) -> serde_json::Value {
    let mut entries = Vec::new();
    for desc in obj.descriptors() {
        if !desc.stored {
            continue;
        }
        let value = match obj.get_param(desc.name) {
            Some(ParamValue::Bool(v)) => json!(v),
            Some(ParamValue::Int(v)) => json!(v),
            Some(ParamValue::Float(v)) => json!(v),
            Some(ParamValue::Str(v)) => json!(v),
            Some(ParamValue::StrList(v)) => json!(v),
            _ => serde_json::Value::Null,
        };
        entries.push(json!({
            "name": desc.name,
            "type": desc.kind.tag(),
            "value": value,
        }));
    }
    serde_json::Value::Array(entries)
}

/// Restore stored scalar parameters serialized by [`store_params`].
pub fn load_params<T: Parameterized + ?Sized>(
    obj: &mut T,
    stored: &serde_json::Value,
) -> Result<(), ConfigError> {
    let entries = match stored {
        serde_json::Value::Array(entries) => entries,
        _ => return Ok(()),
    };
    for entry in entries {
        let name = entry.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let value = entry.get("value").cloned().unwrap_or(serde_json::Value::Null);
        let param = match entry.get("type").and_then(|v| v.as_str()) {
            Some("bool") => ParamValue::Bool(value.as_bool().unwrap_or(false)),
            Some("int") => ParamValue::Int(value.as_i64().unwrap_or(0)),
            Some("float") => ParamValue::Float(value.as_f64().unwrap_or(0.0)),
            Some("str") => ParamValue::Str(value.as_str().unwrap_or("").to_string()),
            Some("str_list") => ParamValue::StrList(
                value
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            ),
            _ => continue,
        };
        obj.set_param(name, param)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        threshold: f64,
        bins: i64,
        tag: String,
        trained_scale: f64,
    }

    impl Default for Probe {
        fn default() -> Self {
            Self {
                threshold: 0.5,
                bins: 16,
                tag: String::new(),
                trained_scale: 1.0,
            }
        }
    }

    impl Parameterized for Probe {
        fn type_name(&self) -> &'static str {
            "Probe"
        }

        fn descriptors(&self) -> &'static [ParamDesc] {
            const DESCS: &[ParamDesc] = &[
                ParamDesc::arg("threshold", ParamKind::Float),
                ParamDesc::arg("bins", ParamKind::Int),
                ParamDesc::arg("tag", ParamKind::Str),
                ParamDesc::stored("trainedScale", ParamKind::Float),
            ];
            DESCS
        }

        fn get_param(&self, name: &str) -> Option<ParamValue> {
            match name {
                "threshold" => Some(ParamValue::Float(self.threshold)),
                "bins" => Some(ParamValue::Int(self.bins)),
                "tag" => Some(ParamValue::Str(self.tag.clone())),
                "trainedScale" => Some(ParamValue::Float(self.trained_scale)),
                _ => None,
            }
        }

        fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
            match (name, value) {
                ("threshold", ParamValue::Float(v)) => self.threshold = v,
                ("bins", ParamValue::Int(v)) => self.bins = v,
                ("tag", ParamValue::Str(v)) => self.tag = v,
                ("trainedScale", ParamValue::Float(v)) => self.trained_scale = v,
                (name, _) => {
                    return Err(ConfigError::UnknownParameter {
                        type_name: "Probe".to_string(),
                        name: name.to_string(),
                    })
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_positional_and_named_binding() {
        let ctx = Context::new();
        let mut probe = Probe::default();
        let args = vec!["0.75".to_string(), "bins=32".to_string()];
        apply_arguments(&mut probe, &args, &ctx).unwrap();
        assert_eq!(probe.threshold, 0.75);
        assert_eq!(probe.bins, 32);
    }

    #[test]
    fn test_unknown_parameter_is_config_error() {
        let ctx = Context::new();
        let mut probe = Probe::default();
        let args = vec!["missing=1".to_string()];
        let err = apply_arguments(&mut probe, &args, &ctx).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownParameter { .. }));
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let ctx = Context::new();
        let mut probe = Probe::default();
        let args = vec!["bins=many".to_string()];
        let err = apply_arguments(&mut probe, &args, &ctx).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));
    }

    #[test]
    fn test_store_load_round_trip() {
        let mut probe = Probe {
            trained_scale: 3.5,
            ..Probe::default()
        };
        let stored = store_params(&probe);
        probe.trained_scale = 0.0;
        load_params(&mut probe, &stored).unwrap();
        assert_eq!(probe.trained_scale, 3.5);
    }

    #[test]
    fn test_render_arguments_skips_stored() {
        let probe = Probe::default();
        let rendered = render_arguments(&probe);
        assert!(rendered.contains("threshold=0.5"));
        assert!(!rendered.contains("trainedScale"));
    }
}
