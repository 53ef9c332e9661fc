//! Data-model primitives shared across the template pipeline engine

pub mod error;
pub mod record;
pub mod template;
pub mod value;

pub use error::{ConfigError, ProcessError, Result};
pub use record::{split_outside_brackets, LabelTable, Record, FAILED_ENROLL, FAILED_OPEN, LABEL};
pub use template::{Mat, Template, TemplateList};
pub use value::Value;
