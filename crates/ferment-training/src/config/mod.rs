//! Job configuration: typed schema, loading, overrides, path resolution and
//! validation.
//!
//! A [`JobConfig`] is resolved once (load → overrides → paths → validation) and
//! then shared read-only as `Arc<JobConfig>` with every stage.

mod overrides;
mod paths;
mod validate;

pub use overrides::{merge, Override};
pub use paths::resolve_paths;
pub use validate::{validate, violations};

use crate::error::{ConfigError, ConfigResult};
use crate::export::ExportMethod;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub model: ModelConfig,
    pub adapter: AdapterConfig,
    pub template: TemplateConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    pub export: ExportConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Hub identifier or local checkpoint directory.
    pub name: String,
    pub max_seq_length: usize,
    pub dtype: DType,
    pub quantization: Quantization,
    /// Engine that loads and trains the model.
    pub engine: String,
    /// Environment variable holding an access token for gated checkpoints.
    pub token_env: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_seq_length: 2048,
            dtype: DType::Auto,
            quantization: Quantization::Nf4,
            engine: "bigram".to_string(),
            token_env: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Auto,
    #[serde(alias = "float32")]
    F32,
    #[serde(alias = "float16")]
    F16,
    #[serde(alias = "bfloat16")]
    Bf16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    None,
    #[serde(alias = "8bit")]
    Int8,
    #[serde(alias = "4bit")]
    Nf4,
}

impl Quantization {
    pub fn is_low_bit(self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    pub rank: u32,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
    pub gradient_checkpointing: GradientCheckpointing,
    pub bias: BiasPolicy,
    pub use_rslora: bool,
    pub seed: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 16.0,
            dropout: 0.0,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            gradient_checkpointing: GradientCheckpointing::Offload,
            bias: BiasPolicy::None,
            use_rslora: false,
            seed: 3407,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientCheckpointing {
    Off,
    On,
    /// Recompute activations and offload saved checkpoints to host memory.
    #[serde(alias = "unsloth")]
    Offload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasPolicy {
    None,
    All,
    LoraOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
    pub name: String,
    pub add_generation_prompt: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self { name: "llama-3.1".to_string(), add_generation_prompt: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub path: PathBuf,
    pub format: DatasetFormat,
    pub split: String,
    pub text_field: String,
    pub message_field: String,
    /// Prefetch worker threads used while formatting (0 formats inline).
    pub workers: usize,
    /// Records formatted per internal batch.
    pub batch_size: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            format: DatasetFormat::Json,
            split: "train".to_string(),
            text_field: "text".to_string(),
            message_field: "messages".to_string(),
            workers: 0,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    /// JSON array of records or JSON Lines, detected from content.
    Json,
    Jsonl,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub grad_accum: usize,
    pub max_steps: u64,
    /// When set, the run length is derived from the dataset size instead of `max_steps`.
    pub num_epochs: Option<u32>,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub scheduler: SchedulerKind,
    pub warmup_steps: u64,
    pub weight_decay: f64,
    pub seed: u64,
    pub logging_steps: u64,
    /// Checkpoint interval in optimizer steps (0 disables intermediate checkpoints).
    pub save_steps: u64,
    pub save_total_limit: Option<usize>,
    pub early_stopping_patience: Option<u64>,
    pub early_stopping_min_delta: f64,
    pub report_to: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::new(),
            batch_size: 2,
            grad_accum: 4,
            max_steps: 30,
            num_epochs: None,
            learning_rate: 2e-4,
            optimizer: OptimizerKind::Adamw8bit,
            scheduler: SchedulerKind::Linear,
            warmup_steps: 5,
            weight_decay: 0.001,
            seed: 3407,
            logging_steps: 1,
            save_steps: 10,
            save_total_limit: Some(3),
            early_stopping_patience: None,
            early_stopping_min_delta: 0.0,
            report_to: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[serde(rename = "adamw_8bit")]
    Adamw8bit,
    Adamw,
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Linear,
    Cosine,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// One or more export formats, attempted independently.
    #[serde(deserialize_with = "one_or_many")]
    pub method: Vec<ExportMethod>,
    /// Root for export directories; defaults to `<output_dir>/final`.
    pub save_path: Option<PathBuf>,
    /// Per-method directory overrides.
    pub paths: BTreeMap<ExportMethod, PathBuf>,
    pub interchange_quantization: String,
    pub remote_push: bool,
    pub remote_id: Option<String>,
    pub remote_endpoint: Option<String>,
    pub remote_token_env: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            method: vec![ExportMethod::MergedFp],
            save_path: None,
            paths: BTreeMap::new(),
            interchange_quantization: "q4_k_m".to_string(),
            remote_push: false,
            remote_id: None,
            remote_endpoint: None,
            remote_token_env: "HF_TOKEN".to_string(),
        }
    }
}

impl ExportConfig {
    /// Directory a given method exports into.
    ///
    /// Only meaningful on a resolved config, where `save_path` is always set.
    pub fn destination(&self, method: ExportMethod, output_dir: &Path) -> PathBuf {
        if let Some(path) = self.paths.get(&method) {
            return path.clone();
        }
        let root = self.save_path.clone().unwrap_or_else(|| output_dir.join("final"));
        root.join(method.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    pub show_memory_stats: bool,
    pub log_training_stats: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { show_memory_stats: true, log_training_stats: true }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ExportMethod>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(ExportMethod),
        Many(Vec<ExportMethod>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(method) => vec![method],
        OneOrMany::Many(methods) => methods,
    })
}

/// On-disk syntax of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Toml,
    Yaml,
}

impl Syntax {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

impl JobConfig {
    /// Load a configuration document (TOML by `.toml` extension, YAML otherwise).
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let parse_error = |message: String| ConfigError::Parse { path: path.display().to_string(), message };

        match Syntax::for_path(path) {
            Syntax::Toml => toml::from_str(&content).map_err(|e| parse_error(e.to_string())),
            Syntax::Yaml => serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string())),
        }
    }

    /// Full resolution pipeline: load, apply overrides, absolutize paths, validate.
    pub fn resolve(path: &Path, overrides: &[Override], root: &Path) -> ConfigResult<Self> {
        let loaded = Self::load(path)?;
        let merged = merge(&loaded, overrides)?;
        let resolved = resolve_paths(&merged, root);
        validate(&resolved)?;
        tracing::debug!(config = %path.display(), overrides = overrides.len(), "configuration resolved");
        Ok(resolved)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse { path: "<resolved>".to_string(), message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r#"
model:
  name: unsloth/Llama-3.2-3B-Instruct
  max_seq_length: 1024
dataset:
  path: data/train.jsonl
  format: jsonl
training:
  output_dir: outputs
  max_steps: 30
export:
  method: lora
"#;

    #[test]
    fn test_load_yaml_applies_defaults_and_aliases() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sft.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = JobConfig::load(&path).unwrap();
        assert_eq!(config.model.max_seq_length, 1024);
        assert_eq!(config.adapter.rank, 16);
        assert_eq!(config.dataset.format, DatasetFormat::Jsonl);
        assert_eq!(config.export.method, vec![ExportMethod::Adapter]);
        assert_eq!(config.training.optimizer, OptimizerKind::Adamw8bit);
    }

    #[test]
    fn test_load_toml_with_method_list() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sft.toml");
        std::fs::write(
            &path,
            r#"
[model]
name = "org/model"

[dataset]
path = "data.json"

[training]
output_dir = "out"

[export]
method = ["adapter", "gguf"]
"#,
        )
        .unwrap();

        let config = JobConfig::load(&path).unwrap();
        assert_eq!(config.export.method, vec![ExportMethod::Adapter, ExportMethod::Interchange]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = JobConfig::load(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_malformed_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yaml");
        std::fs::write(&path, "model: [unclosed").unwrap();
        assert!(matches!(JobConfig::load(&path).unwrap_err(), ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_rejects_unknown_section_field() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("typo.yaml");
        std::fs::write(&path, "training:\n  max_stepz: 3\n").unwrap();
        assert!(matches!(JobConfig::load(&path).unwrap_err(), ConfigError::Parse { .. }));
    }

    #[test]
    fn test_resolve_pipeline() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sft.yaml");
        std::fs::write(&path, YAML).unwrap();

        let overrides = vec![Override::parse("training.max_steps=10").unwrap()];
        let config = JobConfig::resolve(&path, &overrides, temp.path()).unwrap();
        assert_eq!(config.training.max_steps, 10);
        assert!(config.dataset.path.is_absolute());
        assert_eq!(config.export.save_path, Some(temp.path().join("outputs").join("final")));
    }

    #[test]
    fn test_destination_prefers_per_method_path() {
        let mut export = ExportConfig { save_path: Some(PathBuf::from("/out/final")), ..Default::default() };
        export.paths.insert(ExportMethod::Interchange, PathBuf::from("/gguf"));

        assert_eq!(export.destination(ExportMethod::Adapter, Path::new("/out")), PathBuf::from("/out/final/adapter"));
        assert_eq!(export.destination(ExportMethod::Interchange, Path::new("/out")), PathBuf::from("/gguf"));
    }
}
