//! Dynamically-typed metadata values

use serde::{Deserialize, Serialize};
use std::fmt;

/// A metadata value carried by a record. The closed set of kinds covers
/// everything the engine itself needs to interpret; anything richer travels
/// as a string or a nested list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Point(f32, f32),
    Rect(f32, f32, f32, f32),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(*v as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Lenient boolean view: a bare flag (null) or "true" reads as true,
    /// "false" as false, anything else by its numeric value.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => match s.as_str() {
                "" | "true" => true,
                "false" => false,
                other => other.parse::<i64>().map(|v| v != 0).unwrap_or(false),
            },
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Point(x, y) => write!(f, "({x},{y})"),
            Value::Rect(x, y, w, h) => write!(f, "({x},{y},{w},{h})"),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(Value::Int(7).as_float(), Some(7.0));
        assert_eq!(Value::Float(2.5).as_int(), Some(2));
        assert_eq!(Value::Str("42".to_string()).as_int(), Some(42));
        assert_eq!(Value::Str("x".to_string()).as_int(), None);
    }

    #[test]
    fn test_lenient_bool() {
        assert!(Value::Null.as_bool());
        assert!(Value::Str(String::new()).as_bool());
        assert!(Value::Str("true".to_string()).as_bool());
        assert!(!Value::Str("false".to_string()).as_bool());
        assert!(Value::Str("1".to_string()).as_bool());
        assert!(!Value::Str("junk".to_string()).as_bool());
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(Value::List(vec![Value::Int(1), Value::Int(2)]).to_string(), "[1,2]");
        assert_eq!(Value::Point(1.0, 2.0).to_string(), "(1,2)");
    }
}
