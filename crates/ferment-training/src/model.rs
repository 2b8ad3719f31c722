//! Model assembly: base checkpoint load with a precision policy, adapter
//! attachment, chat-template metadata and memory reporting.

use crate::config::{AdapterConfig, BiasPolicy, DType, GradientCheckpointing, JobConfig, ModelConfig, Quantization, TemplateConfig};
use crate::engine::{Architecture, LoadRequest, LoadedModel, MemorySnapshot, TrainingEngine};
use crate::error::{ModelError, ModelResult};
use crate::template::ChatTemplate;
use crate::tokenizer::{ChatTokenizer, TemplateBinding};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Compute dtype after resolving `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    F32,
    F16,
    Bf16,
}

impl ComputeDType {
    pub fn bytes(self) -> f64 {
        match self {
            Self::F32 => 4.0,
            Self::F16 | Self::Bf16 => 2.0,
        }
    }
}

/// How base weights are held in memory for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionPolicy {
    pub compute: ComputeDType,
    pub quantization: Quantization,
}

impl PrecisionPolicy {
    pub fn resolve(dtype: DType, quantization: Quantization) -> Self {
        let compute = match dtype {
            DType::F32 => ComputeDType::F32,
            DType::F16 => ComputeDType::F16,
            DType::Auto | DType::Bf16 => ComputeDType::Bf16,
        };
        Self { compute, quantization }
    }

    /// Storage cost of one frozen base weight.
    pub fn bytes_per_weight(self) -> f64 {
        match self.quantization {
            Quantization::None => self.compute.bytes(),
            Quantization::Int8 => 1.0,
            Quantization::Nf4 => 0.5,
        }
    }
}

impl fmt::Display for PrecisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.compute, self.quantization)
    }
}

/// Low-rank adapter hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub rank: u32,
    pub alpha: f64,
    pub dropout: f64,
    pub target_modules: Vec<String>,
    pub gradient_checkpointing: GradientCheckpointing,
    pub bias: BiasPolicy,
    pub use_rslora: bool,
    pub seed: u64,
}

impl AdapterSpec {
    /// Multiplier applied to the low-rank update (`alpha / rank`, or
    /// `alpha / sqrt(rank)` with rank-stabilized scaling).
    pub fn scaling(&self) -> f64 {
        let rank = f64::from(self.rank.max(1));
        if self.use_rslora { self.alpha / rank.sqrt() } else { self.alpha / rank }
    }
}

impl From<&AdapterConfig> for AdapterSpec {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            rank: config.rank,
            alpha: config.alpha,
            dropout: config.dropout,
            target_modules: config.target_modules.clone(),
            gradient_checkpointing: config.gradient_checkpointing,
            bias: config.bias,
            use_rslora: config.use_rslora,
            seed: config.seed,
        }
    }
}

/// Frozen base weights, exclusively owned for the process lifetime.
pub struct BaseModel {
    name: String,
    inner: Box<dyn LoadedModel>,
}

impl fmt::Debug for BaseModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseModel").field("name", &self.name).field("precision", &self.inner.precision()).finish()
    }
}

impl BaseModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> &Architecture {
        self.inner.architecture()
    }

    pub fn report_memory(&self) -> MemorySnapshot {
        self.inner.memory()
    }
}

pub struct LoadedBase {
    pub model: BaseModel,
    pub tokenizer: ChatTokenizer,
}

/// Base model with trainable adapters attached.
pub struct AdapterModel {
    name: String,
    inner: Box<dyn LoadedModel>,
    spec: AdapterSpec,
    targets: Vec<String>,
    trainable_parameters: u64,
    template: Option<TemplateBinding>,
}

impl fmt::Debug for AdapterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterModel")
            .field("name", &self.name)
            .field("rank", &self.spec.rank)
            .field("targets", &self.targets.len())
            .field("trainable_parameters", &self.trainable_parameters)
            .finish_non_exhaustive()
    }
}

impl AdapterModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    /// Full paths of the modules carrying adapters.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn trainable_parameters(&self) -> u64 {
        self.trainable_parameters
    }

    pub fn total_parameters(&self) -> u64 {
        self.inner.architecture().total_parameters() + self.trainable_parameters
    }

    pub fn template(&self) -> Option<&TemplateBinding> {
        self.template.as_ref()
    }

    pub fn report_memory(&self) -> MemorySnapshot {
        self.inner.memory()
    }

    pub fn engine(&self) -> &dyn LoadedModel {
        self.inner.as_ref()
    }

    pub(crate) fn engine_mut(&mut self) -> &mut dyn LoadedModel {
        self.inner.as_mut()
    }

    /// Drop the adapter, returning the untouched base model.
    pub fn detach(mut self) -> BaseModel {
        self.inner.detach_adapter();
        BaseModel { name: self.name, inner: self.inner }
    }
}

pub struct ModelAssembler {
    config: Arc<JobConfig>,
    engine: Arc<dyn TrainingEngine>,
}

impl ModelAssembler {
    pub fn new(config: Arc<JobConfig>, engine: Arc<dyn TrainingEngine>) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Load the base checkpoint with the configured precision policy applied.
    pub fn load_base(&self, model: &ModelConfig) -> ModelResult<LoadedBase> {
        if model.engine != self.engine.id() {
            return Err(ModelError::UnknownEngine(model.engine.clone()));
        }

        let precision = PrecisionPolicy::resolve(model.dtype, model.quantization);
        let token = model.token_env.as_deref().and_then(|var| std::env::var(var).ok());
        let request = LoadRequest { model: &model.name, max_seq_length: model.max_seq_length, precision, token };

        tracing::info!(model = %model.name, engine = self.engine.id(), %precision, "loading base model");
        let loaded = self
            .engine
            .load(&request)
            .map_err(|source| ModelError::Load { model: model.name.clone(), source })?;

        let arch = loaded.model.architecture();
        tracing::info!(
            model_type = %arch.model_type,
            layers = arch.num_layers,
            parameters = arch.total_parameters(),
            "base model loaded"
        );

        Ok(LoadedBase {
            model: BaseModel { name: model.name.clone(), inner: loaded.model },
            tokenizer: ChatTokenizer::new(loaded.tokenizer),
        })
    }

    /// Attach adapters to the named target modules. Every target must exist on the
    /// base architecture; otherwise nothing is attached and all missing names are
    /// reported together.
    pub fn attach_adapter(&self, base: BaseModel, spec: &AdapterSpec) -> ModelResult<AdapterModel> {
        let arch = base.inner.architecture();

        let mut missing = Vec::new();
        let mut targets = Vec::new();
        for name in &spec.target_modules {
            let matched: Vec<String> = arch.modules_named(name).map(|m| m.path.clone()).collect();
            if matched.is_empty() {
                missing.push(name.clone());
            }
            targets.extend(matched);
        }
        if !missing.is_empty() {
            return Err(ModelError::AdapterConfig {
                architecture: arch.model_type.clone(),
                missing,
                available: arch.module_names(),
            });
        }
        targets.sort();
        targets.dedup();

        let BaseModel { name, mut inner } = base;
        let trainable_parameters = inner.attach_adapter(spec, &targets)?;
        let total = inner.architecture().total_parameters();
        tracing::info!(
            rank = spec.rank,
            modules = targets.len(),
            trainable_parameters,
            trainable_pct = format!("{:.4}", 100.0 * trainable_parameters as f64 / total.max(1) as f64),
            "adapter attached"
        );

        Ok(AdapterModel { name, inner, spec: spec.clone(), targets, trainable_parameters, template: None })
    }

    /// Bind the chat template to the tokenizer and record it on the model.
    ///
    /// Must run before any tokenization. Re-applying the identical template is a
    /// no-op; a different one is refused.
    pub fn apply_chat_template_metadata(
        &self,
        model: &mut AdapterModel,
        tokenizer: &ChatTokenizer,
        template: &TemplateConfig,
    ) -> ModelResult<()> {
        let requested =
            ChatTemplate::from_name(&template.name).ok_or_else(|| ModelError::UnknownTemplate(template.name.clone()))?;

        let binding = tokenizer.bind(requested, template.add_generation_prompt);
        if binding.template != requested || binding.add_generation_prompt != template.add_generation_prompt {
            return Err(ModelError::TemplateConflict {
                current: binding.template.name().to_string(),
                requested: requested.name().to_string(),
            });
        }

        if let Some(current) = &model.template {
            if current != binding {
                return Err(ModelError::TemplateConflict {
                    current: current.template.name().to_string(),
                    requested: requested.name().to_string(),
                });
            }
            return Ok(());
        }

        model.inner.set_template(binding);
        model.template = Some(binding.clone());
        tracing::info!(template = requested.name(), special_tokens = binding.special_tokens.len(), "chat template applied");
        Ok(())
    }

    pub fn report_memory(&self, model: &AdapterModel) -> MemorySnapshot {
        model.report_memory()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedEngine;
    use super::*;
    use crate::tokenizer::testing::BytesTokenizer;

    fn assembler() -> ModelAssembler {
        let mut config = JobConfig::default();
        config.model.name = "org/model".to_string();
        config.model.engine = "scripted".to_string();
        ModelAssembler::new(Arc::new(config), Arc::new(ScriptedEngine::default()))
    }

    fn spec(targets: &[&str]) -> AdapterSpec {
        let mut config = AdapterConfig::default();
        config.target_modules = targets.iter().map(ToString::to_string).collect();
        AdapterSpec::from(&config)
    }

    #[test]
    fn test_precision_policy_resolution() {
        let policy = PrecisionPolicy::resolve(DType::Auto, Quantization::Nf4);
        assert_eq!(policy.compute, ComputeDType::Bf16);
        assert!((policy.bytes_per_weight() - 0.5).abs() < f64::EPSILON);
        assert!((PrecisionPolicy::resolve(DType::F32, Quantization::None).bytes_per_weight() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scaling_with_and_without_rslora() {
        let mut spec = spec(&["q_proj"]);
        spec.rank = 16;
        spec.alpha = 32.0;
        assert!((spec.scaling() - 2.0).abs() < 1e-12);
        spec.use_rslora = true;
        assert!((spec.scaling() - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_load_base_rejects_engine_mismatch() {
        let assembler = assembler();
        let mut model = assembler.config().model.clone();
        model.engine = "other".to_string();
        assert!(matches!(assembler.load_base(&model), Err(ModelError::UnknownEngine(_))));
    }

    #[test]
    fn test_load_base_missing_checkpoint() {
        let assembler = assembler();
        let mut model = assembler.config().model.clone();
        model.name = "/missing/checkpoint".to_string();
        assert!(matches!(assembler.load_base(&model), Err(ModelError::Load { .. })));
    }

    #[test]
    fn test_attach_adapter_targets_only_named_modules() {
        let assembler = assembler();
        let base = assembler.load_base(&assembler.config().model).unwrap().model;
        let model = assembler.attach_adapter(base, &spec(&["q_proj", "v_proj"])).unwrap();

        assert_eq!(model.targets().len(), 4);
        assert!(model.targets().iter().all(|t| t.ends_with("q_proj") || t.ends_with("v_proj")));
        assert!(model.trainable_parameters() > 0);
    }

    #[test]
    fn test_attach_adapter_reports_all_missing_modules() {
        let assembler = assembler();
        let base = assembler.load_base(&assembler.config().model).unwrap().model;
        let err = assembler.attach_adapter(base, &spec(&["q_proj", "gate_proj", "up_proj"])).unwrap_err();

        match err {
            ModelError::AdapterConfig { missing, available, .. } => {
                assert_eq!(missing, vec!["gate_proj", "up_proj"]);
                assert!(available.contains(&"q_proj".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chat_template_applies_once() {
        let assembler = assembler();
        let loaded = assembler.load_base(&assembler.config().model).unwrap();
        let mut model = assembler.attach_adapter(loaded.model, &spec(&["q_proj"])).unwrap();
        let template = TemplateConfig { name: "chatml".to_string(), add_generation_prompt: false };

        assembler.apply_chat_template_metadata(&mut model, &loaded.tokenizer, &template).unwrap();
        assembler.apply_chat_template_metadata(&mut model, &loaded.tokenizer, &template).unwrap();
        assert_eq!(model.template().unwrap().template, ChatTemplate::ChatMl);

        let other = TemplateConfig { name: "llama-3.1".to_string(), add_generation_prompt: false };
        let err = assembler.apply_chat_template_metadata(&mut model, &loaded.tokenizer, &other).unwrap_err();
        assert!(matches!(err, ModelError::TemplateConflict { .. }));
    }

    #[test]
    fn test_template_conflict_on_prebound_tokenizer() {
        let assembler = assembler();
        let loaded = assembler.load_base(&assembler.config().model).unwrap();
        let mut model = assembler.attach_adapter(loaded.model, &spec(&["q_proj"])).unwrap();
        let tokenizer = ChatTokenizer::new(Arc::new(BytesTokenizer));
        tokenizer.bind(ChatTemplate::Plain, false);

        let template = TemplateConfig { name: "chatml".to_string(), add_generation_prompt: false };
        assert!(assembler.apply_chat_template_metadata(&mut model, &tokenizer, &template).is_err());
        assert!(model.template().is_none());
    }

    #[test]
    fn test_report_memory_is_side_effect_free() {
        let assembler = assembler();
        let loaded = assembler.load_base(&assembler.config().model).unwrap();
        let model = assembler.attach_adapter(loaded.model, &spec(&["q_proj"])).unwrap();
        assert_eq!(assembler.report_memory(&model), assembler.report_memory(&model));
        let base = model.detach();
        assert_eq!(base.report_memory().resident_bytes, 1_000);
    }
}
