//! Composite transforms produced by the description resolver

use crate::context::Context;
use crate::params::{ParamDesc, ParamKind, ParamValue, Parameterized};
use crate::transform::{downsample, SamplingParams, Transform};
use rayon::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use template_pipeline_common::{ConfigError, ProcessError, Template, TemplateList};
use tracing::{debug, info, warn};

fn children_description(name: &str, transforms: &[Box<dyn Transform>]) -> String {
    let parts: Vec<String> = transforms.iter().map(|t| t.description()).collect();
    format!("{}([{}])", name, parts.join(","))
}

fn store_children(transforms: &[Box<dyn Transform>]) -> serde_json::Value {
    let states: Vec<serde_json::Value> = transforms.iter().map(|t| t.store()).collect();
    serde_json::Value::Array(states)
}

fn load_children(
    transforms: &mut [Box<dyn Transform>],
    stored: &serde_json::Value,
    ctx: &Context,
) -> Result<(), ConfigError> {
    if let serde_json::Value::Array(states) = stored {
        for (transform, state) in transforms.iter_mut().zip(states) {
            transform.load(state, ctx)?;
        }
    }
    Ok(())
}

/// Sequential application: the output of each stage feeds the next.
#[derive(Default)]
pub struct Pipe {
    transforms: Vec<Box<dyn Transform>>,
}

impl Pipe {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }
}

impl Parameterized for Pipe {
    fn type_name(&self) -> &'static str {
        "Pipe"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[ParamDesc::arg("transforms", ParamKind::TransformList)];
        DESCS
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("transforms", ParamValue::TransformList(list)) => {
                self.transforms = list;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "Pipe".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for Pipe {
    fn trainable(&self) -> bool {
        self.transforms.iter().any(|t| t.trainable())
    }

    fn time_varying(&self) -> bool {
        self.transforms.iter().any(|t| t.time_varying())
    }

    /// Each stage trains on the training set as projected through the
    /// stages before it.
    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        if !self.trainable() {
            return Ok(());
        }
        let mut working = data.clone();
        let last = self.transforms.len().saturating_sub(1);
        for (i, transform) in self.transforms.iter_mut().enumerate() {
            transform.train(&working, ctx)?;
            if i < last {
                working = transform.project_list(&working, ctx);
            }
        }
        Ok(())
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let mut current = src.clone();
        for transform in &self.transforms {
            current = transform.project(&current, ctx)?;
        }
        Ok(current)
    }

    fn back_project(&self, dst: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let mut current = dst.clone();
        for transform in self.transforms.iter().rev() {
            current = transform.back_project(&current, ctx)?;
        }
        Ok(current)
    }

    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        for transform in &mut self.transforms {
            transform.project_update(data, ctx);
        }
    }

    fn description(&self) -> String {
        children_description("Pipe", &self.transforms)
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        let children: Result<Vec<_>, _> =
            self.transforms.iter().map(|t| t.clone_boxed(ctx)).collect();
        Ok(Box::new(Pipe::new(children?)))
    }

    fn store(&self) -> serde_json::Value {
        store_children(&self.transforms)
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        load_children(&mut self.transforms, stored, ctx)
    }
}

/// Parallel branches over the same input, outputs merged channel-wise in
/// branch order.
#[derive(Default)]
pub struct Fork {
    transforms: Vec<Box<dyn Transform>>,
}

impl Fork {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }
}

impl Parameterized for Fork {
    fn type_name(&self) -> &'static str {
        "Fork"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[ParamDesc::arg("transforms", ParamKind::TransformList)];
        DESCS
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("transforms", ParamValue::TransformList(list)) => {
                self.transforms = list;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "Fork".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for Fork {
    fn trainable(&self) -> bool {
        self.transforms.iter().any(|t| t.trainable())
    }

    fn time_varying(&self) -> bool {
        self.transforms.iter().any(|t| t.time_varying())
    }

    /// Every branch trains on the full training set, concurrently when the
    /// parallelism degree and branch count allow.
    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        if ctx.parallelism() > 0 && self.transforms.len() > 1 {
            ctx.pool().install(|| {
                self.transforms
                    .par_iter_mut()
                    .try_for_each(|t| t.train(data, ctx))
            })
        } else {
            for transform in &mut self.transforms {
                transform.train(data, ctx)?;
            }
            Ok(())
        }
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let mut dst = Template::new(src.record.clone());
        for transform in &self.transforms {
            dst.merge(transform.project(src, ctx)?);
        }
        Ok(dst)
    }

    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        let original = data.clone();
        let mut merged: Vec<Template> = original
            .iter()
            .map(|t| Template::new(t.record.clone()))
            .collect();
        for transform in &mut self.transforms {
            let mut branch = original.clone();
            transform.project_update(&mut branch, ctx);
            for (slot, out) in merged.iter_mut().zip(branch) {
                slot.merge(out);
            }
        }
        *data = merged.into();
    }

    fn description(&self) -> String {
        children_description("Fork", &self.transforms)
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        let children: Result<Vec<_>, _> =
            self.transforms.iter().map(|t| t.clone_boxed(ctx)).collect();
        Ok(Box::new(Fork::new(children?)))
    }

    fn store(&self) -> serde_json::Value {
        store_children(&self.transforms)
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        load_children(&mut self.transforms, stored, ctx)
    }
}

/// Fallback composite: the first branch whose projection succeeds wins,
/// later branches are tried only on failure.
#[derive(Default)]
pub struct Chain {
    transforms: Vec<Box<dyn Transform>>,
}

impl Chain {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }
}

impl Parameterized for Chain {
    fn type_name(&self) -> &'static str {
        "Chain"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[ParamDesc::arg("transforms", ParamKind::TransformList)];
        DESCS
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("transforms", ParamValue::TransformList(list)) => {
                self.transforms = list;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "Chain".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for Chain {
    fn trainable(&self) -> bool {
        self.transforms.iter().any(|t| t.trainable())
    }

    fn time_varying(&self) -> bool {
        self.transforms.iter().any(|t| t.time_varying())
    }

    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        for transform in &mut self.transforms {
            transform.train(data, ctx)?;
        }
        Ok(())
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let mut last_error = None;
        for transform in &self.transforms {
            match transform.project(src, ctx) {
                Ok(out) if !out.record.failed() => return Ok(out),
                Ok(_) => continue,
                Err(e) => {
                    debug!(
                        branch = transform.type_name(),
                        error = %e,
                        "chain branch failed, falling through"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| ProcessError::Other("every chain branch failed".to_string())))
    }

    fn description(&self) -> String {
        children_description("Chain", &self.transforms)
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        let children: Result<Vec<_>, _> =
            self.transforms.iter().map(|t| t.clone_boxed(ctx)).collect();
        Ok(Box::new(Chain::new(children?)))
    }

    fn store(&self) -> serde_json::Value {
        store_children(&self.transforms)
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        load_children(&mut self.transforms, stored, ctx)
    }
}

/// Caching decorator: memoizes projections keyed by the element's canonical
/// record rendering.
pub struct Cache {
    transform: Box<dyn Transform>,
    memo: Mutex<HashMap<String, Template>>,
}

impl Cache {
    pub fn new(transform: Box<dyn Transform>) -> Self {
        Self {
            transform,
            memo: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(Box::new(crate::meta::Identity))
    }
}

impl Parameterized for Cache {
    fn type_name(&self) -> &'static str {
        "Cache"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[ParamDesc::arg("transform", ParamKind::Transform)];
        DESCS
    }

    fn set_param(&mut self, name: &str, value: ParamValue) -> Result<(), ConfigError> {
        match (name, value) {
            ("transform", ParamValue::Transform(t)) => {
                self.transform = t;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "Cache".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for Cache {
    fn trainable(&self) -> bool {
        self.transform.trainable()
    }

    fn time_varying(&self) -> bool {
        self.transform.time_varying()
    }

    fn sampling(&self) -> SamplingParams {
        self.transform.sampling()
    }

    fn set_sampling(&mut self, params: SamplingParams) {
        self.transform.set_sampling(params);
    }

    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        self.transform.train(data, ctx)
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let key = blake3::hash(src.record.flat().as_bytes())
            .to_hex()
            .to_string();
        {
            let memo = self
                .memo
                .lock()
                .map_err(|_| ProcessError::Other("cache lock poisoned".to_string()))?;
            if let Some(hit) = memo.get(&key) {
                return Ok(hit.clone());
            }
        }
        let out = self.transform.project(src, ctx)?;
        self.memo
            .lock()
            .map_err(|_| ProcessError::Other("cache lock poisoned".to_string()))?
            .insert(key, out.clone());
        Ok(out)
    }

    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        // Streamed frames are never revisited, so the memo is bypassed.
        self.transform.project_update(data, ctx);
    }

    fn description(&self) -> String {
        format!("Cache({})", self.transform.description())
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(Cache::new(self.transform.clone_boxed(ctx)?)))
    }

    fn store(&self) -> serde_json::Value {
        self.transform.store()
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        self.transform.load(stored, ctx)
    }
}

/// Persistence decorator: trains the wrapped graph then stores it to a model
/// file, or loads the model instead of training when the file already
/// exists.
pub struct LoadStore {
    transform: Box<dyn Transform>,
    file_name: String,
}

impl LoadStore {
    pub fn new(transform: Box<dyn Transform>) -> Self {
        Self {
            transform,
            file_name: String::new(),
        }
    }

    pub fn with_file(transform: Box<dyn Transform>, file_name: impl Into<String>) -> Self {
        Self {
            transform,
            file_name: file_name.into(),
        }
    }

    fn model_path(&self, ctx: &Context) -> PathBuf {
        if self.file_name.is_empty() {
            let digest = blake3::hash(self.transform.description().as_bytes());
            ctx.scratch_dir
                .join(format!("{}.model", &digest.to_hex()[..16]))
        } else {
            PathBuf::from(&self.file_name)
        }
    }
}

impl Default for LoadStore {
    fn default() -> Self {
        Self::new(Box::new(crate::meta::Identity))
    }
}

impl Parameterized for LoadStore {
    fn type_name(&self) -> &'static str {
        "LoadStore"
    }

    fn descriptors(&self) -> &'static [ParamDesc] {
        const DESCS: &[ParamDesc] = &[
            ParamDesc::arg("transform", ParamKind::Transform),
            ParamDesc::arg("fileName", ParamKind::Str),
        ];
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
            ("transform", ParamValue::Transform(t)) => {
                self.transform = t;
                Ok(())
            }
            ("fileName", ParamValue::Str(v)) => {
                self.file_name = v;
                Ok(())
            }
            (name, _) => Err(ConfigError::UnknownParameter {
                type_name: "LoadStore".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

impl Transform for LoadStore {
    fn trainable(&self) -> bool {
        self.transform.trainable()
    }

    fn time_varying(&self) -> bool {
        self.transform.time_varying()
    }

    fn sampling(&self) -> SamplingParams {
        self.transform.sampling()
    }

    fn set_sampling(&mut self, params: SamplingParams) {
        self.transform.set_sampling(params);
    }

    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        let path = self.model_path(ctx);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let model: serde_json::Value = serde_json::from_str(&contents)
                .map_err(|e| ProcessError::Other(format!("corrupt model file: {e}")))?;
            let stored_description = model
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if stored_description != self.transform.description() {
                warn!(
                    file = %path.display(),
                    stored = stored_description,
                    expected = %self.transform.description(),
                    "model file describes a different graph"
                );
            }
            let state = model.get("state").cloned().unwrap_or(serde_json::Value::Null);
            self.transform
                .load(&state, ctx)
                .map_err(|e| ProcessError::Other(e.to_string()))?;
            info!(file = %path.display(), "loaded model");
        } else {
            self.transform.train(data, ctx)?;
            let model = json!({
                "description": self.transform.description(),
                "state": self.transform.store(),
            });
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_string_pretty(&model).map_err(|e| {
                ProcessError::Other(format!("model serialization failed: {e}"))
            })?)?;
            info!(file = %path.display(), "stored model");
        }
        Ok(())
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        self.transform.project(src, ctx)
    }

    fn back_project(&self, dst: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        self.transform.back_project(dst, ctx)
    }

    fn project_update(&mut self, data: &mut TemplateList, ctx: &Context) {
        self.transform.project_update(data, ctx);
    }

    fn description(&self) -> String {
        if self.file_name.is_empty() {
            format!("LoadStore({})", self.transform.description())
        } else {
            format!(
                "LoadStore({},fileName={})",
                self.transform.description(),
                self.file_name
            )
        }
    }

    fn clone_boxed(&self, ctx: &Context) -> Result<Box<dyn Transform>, ConfigError> {
        Ok(Box::new(LoadStore {
            transform: self.transform.clone_boxed(ctx)?,
            file_name: self.file_name.clone(),
        }))
    }

    fn store(&self) -> serde_json::Value {
        self.transform.store()
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        self.transform.load(stored, ctx)
    }
}

/// Per-channel adapter for transforms that must not share state across
/// channels: the prototype is cloned once per training channel, each clone
/// trains on its channel's sub-collection, and projection routes channel i
/// through clone i modulo the clone count.
pub struct Independent {
    transforms: Vec<Box<dyn Transform>>,
}

impl Independent {
    pub fn new(prototype: Box<dyn Transform>) -> Self {
        Self {
            transforms: vec![prototype],
        }
    }

    /// The number of per-channel clones currently held.
    pub fn clone_count(&self) -> usize {
        self.transforms.len()
    }
}

impl Parameterized for Independent {
    fn type_name(&self) -> &'static str {
        self.transforms[0].type_name()
    }
}

impl Transform for Independent {
    fn trainable(&self) -> bool {
        self.transforms[0].trainable()
    }

    fn time_varying(&self) -> bool {
        self.transforms[0].time_varying()
    }

    fn sampling(&self) -> SamplingParams {
        self.transforms[0].sampling()
    }

    fn set_sampling(&mut self, params: SamplingParams) {
        for transform in &mut self.transforms {
            transform.set_sampling(params);
        }
    }

    fn train(&mut self, data: &TemplateList, ctx: &Context) -> Result<(), ProcessError> {
        if !self.transforms[0].trainable() {
            return Ok(());
        }

        // Split the training set by channel index.
        let mut channels: Vec<TemplateList> = Vec::new();
        for template in data {
            if !channels.is_empty() && channels.len() != template.channels.len() {
                warn!(
                    item = %template.record.flat(),
                    expected = channels.len(),
                    actual = template.channels.len(),
                    "training template differs from expected channel count"
                );
            }
            while channels.len() < template.channels.len() {
                channels.push(TemplateList::new());
            }
            for (i, channel) in template.channels.iter().enumerate() {
                channels[i].push(Template::with_channel(
                    template.record.clone(),
                    channel.clone(),
                ));
            }
        }

        while self.transforms.len() < channels.len() {
            let clone = self.transforms[0]
                .clone_boxed(ctx)
                .map_err(|e| ProcessError::Other(e.to_string()))?;
            self.transforms.push(clone);
        }

        let sampled: Vec<TemplateList> = channels
            .iter()
            .enumerate()
            .map(|(i, list)| downsample(list, &self.transforms[i].sampling(), ctx))
            .collect();

        if ctx.parallelism() > 0 && sampled.len() > 1 {
            ctx.pool().install(|| {
                self.transforms[..sampled.len()]
                    .par_iter_mut()
                    .zip(sampled.par_iter())
                    .try_for_each(|(transform, list)| transform.train(list, ctx))
            })
        } else {
            for (transform, list) in self.transforms.iter_mut().zip(&sampled) {
                transform.train(list, ctx)?;
            }
            Ok(())
        }
    }

    fn project(&self, src: &Template, ctx: &Context) -> Result<Template, ProcessError> {
        let mut dst = Template::new(src.record.clone());
        for (i, channel) in src.channels.iter().enumerate() {
            let single = Template::with_channel(src.record.clone(), channel.clone());
            let out = self.transforms[i % self.transforms.len()].project(&single, ctx)?;
            dst.merge(out);
        }
        Ok(dst)
    }

    fn description(&self) -> String {
        self.transforms[0].description()
    }

    fn store(&self) -> serde_json::Value {
        json!({
            "count": self.transforms.len(),
            "clones": store_children(&self.transforms),
        })
    }

    fn load(&mut self, stored: &serde_json::Value, ctx: &Context) -> Result<(), ConfigError> {
        let count = stored
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(1)
            .max(1) as usize;
        while self.transforms.len() < count {
            let clone = self.transforms[0].clone_boxed(ctx)?;
            self.transforms.push(clone);
        }
        if let Some(clones) = stored.get("clones") {
            load_children(&mut self.transforms, clones, ctx)?;
        }
        Ok(())
    }
}
