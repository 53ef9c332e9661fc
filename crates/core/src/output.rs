//! Output sinks receiving comparison scores

use crate::context::Context;
use crate::params::{ParamDesc, ParamKind, ParamValue, Parameterized};
use std::sync::atomic::{AtomicU32, Ordering};
use template_pipeline_common::{ConfigError, Mat, ProcessError, Record};
use tracing::{debug, warn};

/// A sink for comparison scores. Blocked distance dispatch writes disjoint
/// (row, column) cells concurrently, so `set` must be callable through a
/// shared reference; grid-backed sinks use lock-free atomic cells.
pub trait Output: Parameterized + Send + Sync {
    /// Provide the axis records before any scores arrive. `self_similar`
    /// becomes true when the target and query lists are identical.
    fn initialize(&mut self, targets: &[Record], queries: &[Record]);

    /// Write one score at an absolute position.
    fn set(&self, value: f32, row: usize, col: usize);

    /// Offset-adjusted write used by blocked dispatch, fanned out to the
    /// chained sink.
    fn set_relative(&self, value: f32, row: usize, col: usize) {
        let (row_offset, col_offset) = self.block_offset();
        self.set(value, row + row_offset, col + col_offset);
        if let Some(next) = self.next() {
            next.set_relative(value, row, col);
        }
    }

    fn block_offset(&self) -> (usize, usize) {
        (0, 0)
    }

    /// Whether target and query lists are the same gallery.
    fn self_similar(&self) -> bool {
        false
    }

    /// The next sink in the fan-out chain, if any.
    fn next(&self) -> Option<&dyn Output> {
        None
    }

    /// Append a sink to the fan-out chain. Sinks that do not support
    /// chaining drop the argument.
    fn set_next(&mut self, _next: Box<dyn Output>) {}
}

/// Dense row-major score storage with lock-free cells. The blocked dispatch
/// guarantees no two writers touch the same cell.
pub struct ScoreGrid {
    rows: usize,
    cols: usize,
    cells: Vec<AtomicU32>,
}

impl ScoreGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut cells = Vec::with_capacity(rows * cols);
        cells.resize_with(rows * cols, || AtomicU32::new(0f32.to_bits()));
        Self { rows, cols, cells }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn set(&self, value: f32, row: usize, col: usize) {
        debug_assert!(row < self.rows && col < self.cols);
        if row < self.rows && col < self.cols {
            self.cells[row * self.cols + col].store(value.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        f32::from_bits(self.cells[row * self.cols + col].load(Ordering::Relaxed))
    }

    pub fn to_mat(&self) -> Mat {
        Mat::from_shape_fn((self.rows, self.cols), |(r, c)| self.get(r, c))
    }
}

/// In-memory score matrix, readable after a comparison completes.
#[derive(Default)]
pub struct MatrixOutput {
    grid: Option<ScoreGrid>,
    targets: Vec<Record>,
    queries: Vec<Record>,
    self_similar: bool,
    next: Option<Box<dyn Output>>,
}

impl MatrixOutput {
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.grid.as_ref().map(|g| g.get(row, col)).unwrap_or(0.0)
    }

    pub fn to_mat(&self) -> Option<Mat> {
        self.grid.as_ref().map(ScoreGrid::to_mat)
    }

    pub fn targets(&self) -> &[Record] {
        &self.targets
    }

    pub fn queries(&self) -> &[Record] {
        &self.queries
    }
}

impl Parameterized for MatrixOutput {
    fn type_name(&self) -> &'static str {
        "matrix"
    }
}

impl Output for MatrixOutput {
    fn initialize(&mut self, targets: &[Record], queries: &[Record]) {
        self.targets = targets.to_vec();
        self.queries = queries.to_vec();
        self.self_similar = targets == queries && targets.len() > 1;
        self.grid = Some(ScoreGrid::new(queries.len(), targets.len()));
    }

    fn set(&self, value: f32, row: usize, col: usize) {
        if let Some(grid) = &self.grid {
            grid.set(value, row, col);
        }
    }

    fn self_similar(&self) -> bool {
        self.self_similar
    }

    fn next(&self) -> Option<&dyn Output> {
        self.next.as_deref()
    }

    fn set_next(&mut self, next: Box<dyn Output>) {
        self.next = Some(next);
    }
}

/// Score matrix written to a CSV file when the sink is dropped (or
/// explicitly flushed): one header row of target names, then one row per
/// query.
#[derive(Default)]
pub struct CsvOutput {
    file_name: String,
    grid: Option<ScoreGrid>,
    targets: Vec<Record>,
    queries: Vec<Record>,
    self_similar: bool,
    next: Option<Box<dyn Output>>,
}

impl CsvOutput {
    pub fn write(&self) -> Result<(), ProcessError> {
        let grid = match &self.grid {
            Some(grid) => grid,
            None => return Ok(()),
        };
        let mut lines = Vec::with_capacity(grid.rows() + 1);
        let mut header = vec!["File".to_string()];
        header.extend(self.targets.iter().map(|r| r.name.clone()));
        lines.push(header.join(","));
        for (row, query) in self.queries.iter().enumerate() {
            let mut fields = vec![query.name.clone()];
            for col in 0..grid.cols() {
                fields.push(grid.get(row, col).to_string());
            }
            lines.push(fields.join(","));
        }
        std::fs::write(&self.file_name, lines.join("\n") + "\n")?;
        debug!(file = %self.file_name, "wrote score matrix");
        Ok(())
    }
}

impl Drop for CsvOutput {
    fn drop(&mut self) {
        if self.grid.is_some() && !self.file_name.is_empty() {
            if let Err(e) = self.write() {
                warn!(file = %self.file_name, error = %e, "failed to write scores");
            }
        }
    }
}

impl Parameterized for CsvOutput {
    fn type_name(&self) -> &'static str {
        "csv"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[ParamDesc::arg("fileName", ParamKind::Str)];
        DESCS
    }

    fn get_param(&self, name: &str) -> Option<ParamValue> {
        match name {
            "fileName" => Some(ParamValue::Str(self.file_name.clone())),
            _ => None,
        }
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("fileName", ParamValue::Str(v)) => {
                self.file_name = v;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "csv".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Output for CsvOutput {
    fn initialize(&mut self, targets: &[Record], queries: &[Record]) {
        self.targets = targets.to_vec();
        self.queries = queries.to_vec();
        self.self_similar = targets == queries && targets.len() > 1;
        self.grid = Some(ScoreGrid::new(queries.len(), targets.len()));
    }

    fn set(&self, value: f32, row: usize, col: usize) {
        if let Some(grid) = &self.grid {
            grid.set(value, row, col);
        }
    }

    fn self_similar(&self) -> bool {
        self.self_similar
    }

    fn next(&self) -> Option<&dyn Output> {
        self.next.as_deref()
    }

    fn set_next(&mut self, next: Box<dyn Output>) {
        self.next = Some(next);
    }
}

/// Build an output chain from a specification like `scores.csv;backup.csv`.
/// Each part resolves by file extension through the output registry,
/// falling back to the in-memory matrix sink.
pub fn make(
    spec: &str,
    targets: &[Record],
    queries: &[Record],
    ctx: &Context,
) -> Result<Box<dyn Output>, ConfigError> {
    let mut chain: Option<Box<dyn Output>> = None;
    for part in spec.split(';').rev() {
        let part = part.trim();
        let record = Record::parse(part).map_err(|e| ConfigError::Malformed {
            fragment: part.to_string(),
            reason: e.to_string(),
        })?;
        let extension = std::path::Path::new(&record.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let name = if ctx.outputs.contains(&extension) {
            extension
        } else {
            "matrix".to_string()
        };
        let mut output = ctx.outputs.make(&name, &[], ctx)?;
        if output.descriptors().iter().any(|d| d.name == "fileName") {
            output.set_param("fileName", ParamValue::Str(record.name.clone()))?;
        }
        output.initialize(targets, queries);
        if let Some(next) = chain.take() {
            output.set_next(next);
        }
        chain = Some(output);
    }
    chain.ok_or_else(|| ConfigError::Malformed {
        fragment: spec.to_string(),
        reason: "empty output specification".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(prefix: &str, n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::new(format!("{prefix}{i}"))).collect()
    }

    #[test]
    fn test_matrix_output_round_trip() {
        let mut output = MatrixOutput::default();
        output.initialize(&records("t", 3), &records("q", 2));
        output.set(0.5, 1, 2);
        assert_eq!(output.get(1, 2), 0.5);
        assert_eq!(output.get(0, 0), 0.0);
        assert!(!output.self_similar());

        let mat = output.to_mat().unwrap();
        assert_eq!(mat.dim(), (2, 3));
    }

    #[test]
    fn test_self_similar_flag() {
        let gallery = records("g", 3);
        let mut output = MatrixOutput::default();
        output.initialize(&gallery, &gallery);
        assert!(output.self_similar());
    }

    #[test]
    fn test_chain_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chained.csv");

        let mut first = MatrixOutput::default();
        first.initialize(&records("t", 2), &records("q", 1));
        let mut second = CsvOutput::default();
        second
            .set_param("fileName", ParamValue::Str(path.display().to_string()))
            .unwrap();
        second.initialize(&records("t", 2), &records("q", 1));
        first.set_next(Box::new(second));

        first.set_relative(0.7, 0, 1);
        assert_eq!(first.get(0, 1), 0.7);

        // Dropping the chain flushes the chained CSV sink, which observed
        // the same write.
        drop(first);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.lines().nth(1).unwrap().ends_with(",0,0.7"));
    }

    #[test]
    fn test_csv_output_writes_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.csv");
        {
            let mut output = CsvOutput::default();
            output
                .set_param("fileName", ParamValue::Str(path.display().to_string()))
                .unwrap();
            output.initialize(&records("t", 2), &records("q", 1));
            output.set(1.5, 0, 0);
            output.set(-2.0, 0, 1);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "File,t0,t1");
        assert_eq!(lines[1], "q0,1.5,-2");
    }

    #[test]
    fn test_make_by_extension() {
        let ctx = Context::initialized();
        let output = make("anything", &records("t", 1), &records("q", 1), &ctx).unwrap();
        assert_eq!(output.type_name(), "matrix");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv").display().to_string();
        let output = make(&path, &records("t", 1), &records("q", 1), &ctx).unwrap();
        assert_eq!(output.type_name(), "csv");
    }
}
