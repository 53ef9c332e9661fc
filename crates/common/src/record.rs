//! Metadata records and the process-wide label table

use crate::error::ProcessError;
use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

/// Metadata key flagging an element that failed to enroll during projection.
pub const FAILED_ENROLL: &str = "FTE";

/// Metadata key flagging an element whose source could not be opened.
pub const FAILED_OPEN: &str = "FTO";

/// Metadata key holding the class label.
pub const LABEL: &str = "Label";

/// An ordered name plus a mapping of string keys to dynamically-typed values.
/// Records travel with every template and survive projection even when the
/// data channels do not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub name: String,
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    /// Parse a record specification of the form `name[key=value, flag]` or
    /// `name(arg, ...)`. Trailing blocks are peeled off right-to-left; a
    /// parenthesized block contributes positional `_arg<i>` keys.
    pub fn parse(spec: &str) -> Result<Self, ProcessError> {
        let mut name = spec.to_string();
        let mut record = Record::default();

        while name.ends_with(']') || name.ends_with(')') {
            let unnamed = name.ends_with(')');
            let (open, close) = if unnamed { ('(', ')') } else { ('[', ']') };

            let bytes: Vec<char> = name.chars().collect();
            let mut depth = 0i32;
            let mut index = None;
            for i in (0..bytes.len()).rev() {
                if bytes[i] == close {
                    depth -= 1;
                } else if bytes[i] == open {
                    depth += 1;
                }
                if depth == 0 {
                    index = Some(i);
                    break;
                }
            }
            let index = index.ok_or_else(|| {
                ProcessError::Other(format!("unbalanced brackets in record spec `{spec}`"))
            })?;

            let inner: String = bytes[index + 1..bytes.len() - 1].iter().collect();
            for (i, part) in split_outside_brackets(&inner, ',').iter().enumerate() {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                match part.split_once('=') {
                    Some((key, value)) => {
                        record.set(key.trim(), Value::Str(value.trim().to_string()))
                    }
                    None if unnamed => record.set(format!("_arg{i}"), Value::Str(part.to_string())),
                    None => record.set(part, Value::Null),
                }
            }
            name.truncate(index);
        }

        record.name = name;
        Ok(record)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Merge another record's values into this one, overwriting duplicates.
    pub fn append(&mut self, other: &Record) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ProcessError> {
        let value = self
            .get(key)
            .ok_or_else(|| ProcessError::MissingKey(key.to_string()))?;
        value.as_int().ok_or_else(|| ProcessError::InvalidConversion {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_int).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str) -> Result<f64, ProcessError> {
        let value = self
            .get(key)
            .ok_or_else(|| ProcessError::MissingKey(key.to_string()))?;
        value
            .as_float()
            .ok_or_else(|| ProcessError::InvalidConversion {
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    pub fn get_float_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(Value::as_float).unwrap_or(default)
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    /// Flag semantics: a set flag is stored as a bare null value, clearing a
    /// flag removes the key entirely.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        if value {
            self.values.insert(key.to_string(), Value::Null);
        } else {
            self.values.remove(key);
        }
    }

    pub fn get_flag(&self, key: &str) -> bool {
        self.get(key).map(Value::as_bool).unwrap_or(false)
    }

    /// True when this element is marked as a prior processing failure.
    pub fn failed(&self) -> bool {
        self.get_flag(FAILED_ENROLL) || self.get_flag(FAILED_OPEN)
    }

    /// Resolve the class label to a number. String labels are interned in
    /// the process-wide label table the first time they are seen; numeric
    /// labels pass through; an absent label reads as -1.
    pub fn label(&self, labels: &LabelTable) -> f32 {
        match self.get(LABEL) {
            None | Some(Value::Null) => -1.0,
            Some(Value::Str(s)) => match s.parse::<f32>() {
                Ok(v) if !s.starts_with('0') || s == "0" => v,
                // Non-numeric, or zero-prefixed and probably a string UID.
                _ => labels.intern(s) as f32,
            },
            Some(v) => v.as_float().map(|f| f as f32).unwrap_or(-1.0),
        }
    }

    /// Canonical flat rendering: `name[k1=v1, k2, ...]` with keys in stable
    /// order. Used for cache keys and clone-by-description.
    pub fn flat(&self) -> String {
        let mut parts = Vec::with_capacity(self.values.len());
        for (key, value) in &self.values {
            if value.is_null() {
                parts.push(key.clone());
            } else {
                parts.push(format!("{key}={value}"));
            }
        }
        if parts.is_empty() {
            self.name.clone()
        } else {
            format!("{}[{}]", self.name, parts.join(", "))
        }
    }
}

/// Process-wide class-label table. Assigns each distinct string label a
/// stable, monotonically-increasing id the first time it is seen; entries are
/// never removed for the lifetime of the process. Inserts are serialized
/// under a single lock since lookups may race with first-time registration.
#[derive(Debug, Default)]
pub struct LabelTable {
    inner: Mutex<LabelState>,
}

#[derive(Debug, Default)]
struct LabelState {
    by_name: HashMap<String, i32>,
    names: Vec<String>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `name`, assigning the next id on first sight.
    pub fn intern(&self, name: &str) -> i32 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = state.by_name.get(name) {
            return id;
        }
        let id = state.names.len() as i32;
        state.by_name.insert(name.to_string(), id);
        state.names.push(name.to_string());
        id
    }

    pub fn get(&self, name: &str) -> Option<i32> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .copied()
    }

    /// Reverse lookup: the string label for an id, falling back to the
    /// number itself for labels that were never interned.
    pub fn subject(&self, id: i32) -> String {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .names
            .get(id as usize)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `input` on `separator`, ignoring separators nested inside any of
/// `()`, `[]`, `{}` or `<>`. Returns an error-free best effort; callers that
/// care about balance validate it separately.
pub fn split_outside_brackets(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for ch in input.chars() {
        match ch {
            '(' | '[' | '{' | '<' => depth += 1,
            ')' | ']' | '}' | '>' => depth -= 1,
            _ => {}
        }
        if ch == separator && depth == 0 {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    parts.push(current);
    parts
}
