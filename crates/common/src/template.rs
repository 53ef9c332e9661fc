//! Templates and template collections

use crate::error::ProcessError;
use crate::record::{LabelTable, Record};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// The raw data buffer type carried by template channels.
pub type Mat = ndarray::Array2<f32>;

/// An ordered sequence of raw data channels plus one metadata record; the
/// unit of work flowing through the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
    pub record: Record,
    pub channels: Vec<Mat>,
}

impl Template {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            channels: Vec::new(),
        }
    }

    pub fn with_channel(record: Record, channel: Mat) -> Self {
        Self {
            record,
            channels: vec![channel],
        }
    }

    /// An empty result carrying the original metadata, used when projection
    /// of an element fails.
    pub fn failed(record: Record) -> Self {
        let mut template = Template::new(record);
        template.record.set_flag(crate::record::FAILED_ENROLL, true);
        template
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// The single matrix of a single-matrix template.
    pub fn mat(&self) -> Result<&Mat, ProcessError> {
        if self.channels.len() != 1 {
            return Err(ProcessError::ChannelCount {
                expected: 1,
                actual: self.channels.len(),
            });
        }
        Ok(&self.channels[0])
    }

    /// Append another template's channels and metadata, preserving channel
    /// order.
    pub fn merge(&mut self, other: Template) {
        self.channels.extend(other.channels);
        self.record.append(&other.record);
    }
}

/// An ordered sequence of templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateList(pub Vec<Template>);

impl TemplateList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Per-element class labels.
    pub fn labels(&self, labels: &LabelTable) -> Vec<f32> {
        self.0.iter().map(|t| t.record.label(labels)).collect()
    }

    /// Count of elements per integer label, optionally skipping elements
    /// flagged as prior failures.
    pub fn label_counts(&self, labels: &LabelTable, exclude_failures: bool) -> BTreeMap<i32, usize> {
        let mut counts = BTreeMap::new();
        for template in &self.0 {
            if exclude_failures && template.record.failed() {
                continue;
            }
            *counts.entry(template.record.label(labels) as i32).or_insert(0) += 1;
        }
        counts
    }

    /// Number of elements flagged as prior failures.
    pub fn failures(&self) -> usize {
        self.0.iter().filter(|t| t.record.failed()).count()
    }

    /// Partition into consecutive sub-collections sized by `counts`. The
    /// counts must sum to the collection length.
    pub fn partition(&self, counts: &[usize]) -> Result<Vec<TemplateList>, ProcessError> {
        let total: usize = counts.iter().sum();
        if total != self.0.len() {
            return Err(ProcessError::Other(format!(
                "partition counts sum to {total} but the collection holds {}",
                self.0.len()
            )));
        }
        let mut parts = Vec::with_capacity(counts.len());
        let mut start = 0;
        for &count in counts {
            parts.push(TemplateList(self.0[start..start + count].to_vec()));
            start += count;
        }
        Ok(parts)
    }
}

impl Deref for TemplateList {
    type Target = Vec<Template>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for TemplateList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Template>> for TemplateList {
    fn from(templates: Vec<Template>) -> Self {
        Self(templates)
    }
}

impl FromIterator<Template> for TemplateList {
    fn from_iter<I: IntoIterator<Item = Template>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TemplateList {
    type Item = Template;
    type IntoIter = std::vec::IntoIter<Template>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TemplateList {
    type Item = &'a Template;
    type IntoIter = std::slice::Iter<'a, Template>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
