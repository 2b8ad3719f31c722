//! The narrow interface to the numerics.
//!
//! A [`TrainingEngine`] loads checkpoints; the resulting [`LoadedModel`] owns the
//! weights and exposes exactly what orchestration needs: adapter attachment, one
//! micro-batch forward/backward, one optimizer update, memory accounting and the
//! save routines the exporters call. Everything behind these traits is opaque.

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::EngineResult;
use crate::model::{AdapterSpec, PrecisionPolicy};
use crate::tokenizer::{TemplateBinding, Tokenizer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A named linear module of the base architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Full dotted path, e.g. `model.layers.0.self_attn.q_proj`.
    pub path: String,
    pub in_features: usize,
    pub out_features: usize,
}

impl ModuleInfo {
    /// Last path segment (`q_proj` for `model.layers.0.self_attn.q_proj`).
    pub fn short_name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }

    pub fn parameters(&self) -> u64 {
        (self.in_features * self.out_features) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub model_type: String,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub vocab_size: usize,
    pub modules: Vec<ModuleInfo>,
}

impl Architecture {
    pub fn total_parameters(&self) -> u64 {
        let embeddings = (self.vocab_size * self.hidden_size) as u64;
        embeddings + self.modules.iter().map(ModuleInfo::parameters).sum::<u64>()
    }

    /// Modules whose path or final segment equals `name`.
    pub fn modules_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ModuleInfo> + 'a {
        self.modules.iter().filter(move |m| m.short_name() == name || m.path == name)
    }

    /// Distinct short module names, sorted.
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|m| m.short_name().to_string()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub model: &'a str,
    pub max_seq_length: usize,
    pub precision: PrecisionPolicy,
    pub token: Option<String>,
}

pub struct LoadedCheckpoint {
    pub model: Box<dyn LoadedModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Bytes currently held by weights, adapters and optimizer state.
    pub resident_bytes: u64,
    /// Bytes reserved on the device, including activation workspace.
    pub reserved_bytes: u64,
}

impl MemorySnapshot {
    pub fn resident_gib(&self) -> f64 {
        self.resident_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    pub fn reserved_gib(&self) -> f64 {
        self.reserved_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// One sequence of a micro-batch. `labels[i]` is `None` where the loss is masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainSequence {
    pub input_ids: Vec<u32>,
    pub labels: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MicroBatch {
    pub sequences: Vec<TrainSequence>,
}

impl MicroBatch {
    pub fn supervised_tokens(&self) -> usize {
        self.sequences.iter().map(|s| s.labels.iter().filter(|l| l.is_some()).count()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    pub kind: OptimizerKind,
    pub weight_decay: f64,
    pub seed: u64,
}

impl From<&TrainingConfig> for OptimizerSpec {
    fn from(config: &TrainingConfig) -> Self {
        Self { kind: config.optimizer, weight_decay: config.weight_decay, seed: config.seed }
    }
}

/// Weight precision of a merged export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePrecision {
    /// 16-bit floating point weights.
    Half,
    /// 4-bit quantized weights.
    LowBit,
}

/// Files an engine wrote for one save call.
pub type SavedFiles = Vec<PathBuf>;

pub trait TrainingEngine: Send + Sync {
    fn id(&self) -> &'static str;

    fn load(&self, request: &LoadRequest<'_>) -> EngineResult<LoadedCheckpoint>;
}

pub trait LoadedModel: Send {
    fn architecture(&self) -> &Architecture;

    fn precision(&self) -> PrecisionPolicy;

    /// Create trainable low-rank parameters on `modules` (full paths); everything
    /// else stays frozen. Returns the number of trainable parameters.
    fn attach_adapter(&mut self, spec: &AdapterSpec, modules: &[String]) -> EngineResult<u64>;

    fn detach_adapter(&mut self);

    /// Record the chat template metadata saved alongside exported weights.
    fn set_template(&mut self, binding: &TemplateBinding);

    fn configure_optimizer(&mut self, spec: &OptimizerSpec) -> EngineResult<()>;

    /// Forward + backward over one micro-batch, accumulating gradients. Returns the
    /// mean loss over supervised tokens.
    fn forward_backward(&mut self, batch: &MicroBatch) -> EngineResult<f64>;

    /// Apply accumulated gradients and clear them.
    fn optimizer_step(&mut self, learning_rate: f64) -> EngineResult<()>;

    fn memory(&self) -> MemorySnapshot;

    fn save_adapter(&self, dir: &Path) -> EngineResult<SavedFiles>;

    fn save_merged(&self, dir: &Path, precision: MergePrecision) -> EngineResult<SavedFiles>;

    fn save_interchange(&self, dir: &Path, quantization: &str) -> EngineResult<SavedFiles>;
}
