//! Composition-and-execution engine for template processing pipelines
//!
//! Algorithms are registered by name, composed from a textual description
//! grammar, and applied to template collections in batch or to live frame
//! sequences through the streaming pipeline.

pub mod buffer;
pub mod composite;
pub mod context;
pub mod describe;
pub mod distance;
pub mod format;
pub mod meta;
pub mod output;
pub mod params;
pub mod registry;
pub mod stream;
pub mod transform;

pub use buffer::{DoubleBuffer, SharedBuffer, SingleBuffer};
pub use context::Context;
pub use describe::{distance_from, transform_from, DescriptionNode};
pub use distance::{Distance, REJECTED};
pub use format::Format;
pub use output::{MatrixOutput, Output};
pub use registry::{register_builtins, Registry};
pub use stream::{Frame, FramePool, FrameSource, StreamTransform};
pub use transform::{downsample, SamplingParams, Transform};

pub use template_pipeline_common::{
    ConfigError, LabelTable, Mat, ProcessError, Record, Template, TemplateList, Value,
};
