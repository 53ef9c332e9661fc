//! Process context: the single injectable home for everything the original
//! design kept in process-wide globals

use crate::distance::Distance;
use crate::format::Format;
use crate::output::Output;
use crate::registry::Registry;
use crate::transform::Transform;
use rayon::{ThreadPool, ThreadPoolBuilder};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use template_pipeline_common::{ConfigError, LabelTable};
use tracing::debug;

/// Created once at process start and passed by reference to the registries,
/// the description resolver and every dispatch site. Registration and
/// configuration happen before a run starts; during a run the context is
/// only read, except for the internally-locked label table.
pub struct Context {
    /// Process-wide class-label table.
    pub labels: LabelTable,

    /// Capability registries.
    pub transforms: Registry<dyn Transform>,
    pub distances: Registry<dyn Distance>,
    pub formats: Registry<dyn Format>,
    pub outputs: Registry<dyn Output>,

    /// Metadata admission filters applied before distance comparison:
    /// field name to required pattern.
    pub filters: HashMap<String, Regex>,

    /// Whole-description aliases substituted before resolution.
    pub abbreviations: HashMap<String, String>,

    /// Seed for reproducible downsampling within a run.
    pub seed: u64,

    /// Extra diagnostics from transforms that honor it.
    pub verbose: bool,

    /// Where persistence decorators place model files by default.
    pub scratch_dir: PathBuf,

    parallelism: usize,
    pool: ThreadPool,
}

impl Context {
    /// A context with the default parallelism degree and empty registries.
    pub fn new() -> Self {
        let parallelism = num_cpus::get();
        Self {
            labels: LabelTable::new(),
            transforms: Registry::new("transform"),
            distances: Registry::new("distance"),
            formats: Registry::new("format"),
            outputs: Registry::new("output"),
            filters: HashMap::new(),
            abbreviations: HashMap::new(),
            seed: 0,
            verbose: false,
            scratch_dir: std::env::temp_dir(),
            parallelism,
            pool: build_pool(parallelism),
        }
    }

    /// A context with the built-in transforms, distances, formats and
    /// outputs already registered.
    pub fn initialized() -> Self {
        let mut ctx = Self::new();
        crate::registry::register_builtins(&mut ctx);
        ctx
    }

    /// The configured parallelism degree; 0 means sequential dispatch.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Set the parallelism degree. Only supported before a run starts; the
    /// worker pool is rebuilt to match.
    pub fn set_parallelism(&mut self, parallelism: usize) {
        debug!(parallelism, "setting parallelism");
        self.parallelism = parallelism;
        self.pool = build_pool(parallelism);
    }

    /// The shared worker pool used by every dispatch site.
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Require a regex match on a target metadata field before comparison.
    pub fn add_filter(&mut self, field: &str, pattern: &str) -> Result<(), ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::Malformed {
            fragment: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.filters.insert(field.to_string(), regex);
        Ok(())
    }

    pub fn add_abbreviation(&mut self, alias: &str, expansion: &str) {
        self.abbreviations
            .insert(alias.to_string(), expansion.to_string());
    }

    /// Load an abbreviation table from a YAML mapping of alias to expansion.
    pub fn load_abbreviations(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let table: HashMap<String, String> =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Malformed {
                fragment: "abbreviation table".to_string(),
                reason: e.to_string(),
            })?;
        debug!(count = table.len(), "loaded abbreviations");
        self.abbreviations.extend(table);
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn build_pool(parallelism: usize) -> ThreadPool {
    ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .build()
        .expect("failed to build worker pool")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parallelism_matches_cores() {
        let ctx = Context::new();
        assert_eq!(ctx.parallelism(), num_cpus::get());
    }

    #[test]
    fn test_sequential_context_still_has_a_pool() {
        let mut ctx = Context::new();
        ctx.set_parallelism(0);
        assert_eq!(ctx.parallelism(), 0);
        assert_eq!(ctx.pool().current_num_threads(), 1);
    }

    #[test]
    fn test_filter_compilation_errors_are_config_errors() {
        let mut ctx = Context::new();
        assert!(ctx.add_filter("Gender", "^(male").is_err());
        assert!(ctx.add_filter("Gender", "^male$").is_ok());
    }

    #[test]
    fn test_abbreviations_from_yaml() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "FaceRec: \"Open+Center/Identity\"").unwrap();
        let mut ctx = Context::new();
        ctx.load_abbreviations(file.path()).unwrap();
        assert_eq!(
            ctx.abbreviations.get("FaceRec").map(String::as_str),
            Some("Open+Center/Identity")
        );
    }
}
