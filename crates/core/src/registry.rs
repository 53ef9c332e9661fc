//! Capability registries mapping type names to constructors

use crate::context::Context;
use crate::params::{apply_arguments, Parameterized};
use std::collections::HashMap;
use template_pipeline_common::ConfigError;
use tracing::debug;

/// Constructor for a registered type.
pub type Maker<T> = fn() -> Box<T>;

/// A registry of constructors for one abstract capability (transforms,
/// distances, formats, outputs). Populated once at process start; read-only
/// afterwards.
pub struct Registry<T: ?Sized> {
    capability: &'static str,
    makers: HashMap<String, Maker<T>>,
}

impl<T: Parameterized + ?Sized> Registry<T> {
    pub fn new(capability: &'static str) -> Self {
        Self {
            capability,
            makers: HashMap::new(),
        }
    }

    /// Register a constructor under a type name. This is the sole extension
    /// point for adding new algorithms without modifying the engine.
    pub fn register(&mut self, name: &str, maker: Maker<T>) {
        debug!(capability = self.capability, name, "registering");
        self.makers.insert(name.to_string(), maker);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.makers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.makers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Instantiate a registered type and configure it from a description's
    /// parsed argument list.
    pub fn make(&self, name: &str, args: &[String], ctx: &Context) -> Result<Box<T>, ConfigError> {
        let maker = self
            .makers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownType {
                capability: self.capability,
                name: name.to_string(),
            })?;
        let mut object = maker();
        apply_arguments(object.as_mut(), args, ctx)?;
        Ok(object)
    }
}

/// Wire the built-in types into a context's registries. Called once at
/// process start; external plugins register the same way afterwards.
pub fn register_builtins(ctx: &mut Context) {
    use crate::composite::{Cache, Chain, Fork, LoadStore, Pipe};
    use crate::distance::{L1Distance, L2Distance};
    use crate::format::{ImageFormat, RawFormat};
    use crate::meta::{Center, Discard, First, Identity, Open, Rest};
    use crate::output::{CsvOutput, MatrixOutput};
    use crate::stream::StreamTransform;

    ctx.transforms.register("Identity", || Box::new(Identity));
    ctx.transforms.register("Discard", || Box::new(Discard));
    ctx.transforms.register("First", || Box::new(First));
    ctx.transforms.register("Rest", || Box::new(Rest));
    ctx.transforms.register("Open", || Box::new(Open));
    ctx.transforms.register("Center", || Box::<Center>::default());
    ctx.transforms.register("Pipe", || Box::<Pipe>::default());
    ctx.transforms.register("Fork", || Box::<Fork>::default());
    ctx.transforms.register("Chain", || Box::<Chain>::default());
    ctx.transforms.register("Cache", || Box::<Cache>::default());
    ctx.transforms
        .register("LoadStore", || Box::<LoadStore>::default());
    ctx.transforms
        .register("Stream", || Box::<StreamTransform>::default());

    ctx.distances.register("L1", || Box::new(L1Distance));
    ctx.distances.register("L2", || Box::new(L2Distance));

    ctx.formats.register("raw", || Box::new(RawFormat));
    ctx.formats.register("png", || Box::new(ImageFormat));
    ctx.formats.register("jpg", || Box::new(ImageFormat));
    ctx.formats.register("jpeg", || Box::new(ImageFormat));

    ctx.outputs
        .register("matrix", || Box::<MatrixOutput>::default());
    ctx.outputs.register("csv", || Box::<CsvOutput>::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_is_fatal() {
        let ctx = Context::initialized();
        let err = ctx.transforms.make("NoSuch", &[], &ctx).err().unwrap();
        assert!(matches!(
            err,
            ConfigError::UnknownType {
                capability: "transform",
                ..
            }
        ));
    }

    #[test]
    fn test_builtins_are_registered() {
        let ctx = Context::initialized();
        for name in ["Identity", "Discard", "Open", "Center", "Stream"] {
            assert!(ctx.transforms.contains(name), "missing transform {name}");
        }
        assert!(ctx.distances.contains("L1"));
        assert!(ctx.formats.contains("raw"));
        assert!(ctx.outputs.contains("matrix"));
    }

    #[test]
    fn test_external_registration() {
        use crate::meta::Identity;
        let mut ctx = Context::new();
        ctx.transforms.register("Alias", || Box::new(Identity));
        assert!(ctx.transforms.make("Alias", &[], &ctx).is_ok());
    }
}
