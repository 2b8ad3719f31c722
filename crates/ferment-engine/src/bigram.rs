//! A CPU engine small enough to run the whole pipeline without a model download.
//!
//! The frozen base predicts the next token uniformly. The adapter is a real
//! low-rank correction of the next-token logits, `scaling * A[prev] · B[next]`,
//! trained with cross-entropy over supervised positions only. Module shapes from
//! the checkpoint config drive parameter and memory accounting.

use crate::checkpoint::CheckpointConfig;
use crate::gguf;
use crate::tokenizer::ByteTokenizer;
use ferment_training::config::{BiasPolicy, GradientCheckpointing, OptimizerKind};
use ferment_training::engine::{
    Architecture, LoadRequest, LoadedCheckpoint, LoadedModel, MemorySnapshot, MergePrecision, MicroBatch,
    OptimizerSpec, SavedFiles, TrainingEngine,
};
use ferment_training::{AdapterSpec, EngineError, EngineResult, PrecisionPolicy, TemplateBinding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, Default)]
pub struct BigramEngine {
    memory_budget: Option<u64>,
}

impl BigramEngine {
    pub const ID: &'static str = "bigram";

    pub fn new() -> Self {
        Self::default()
    }

    /// Fail micro-batches whose footprint would exceed `bytes`.
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

fn is_local(model: &str) -> bool {
    model.starts_with('.') || model.starts_with('~') || Path::new(model).is_absolute()
}

impl TrainingEngine for BigramEngine {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn load(&self, request: &LoadRequest<'_>) -> EngineResult<LoadedCheckpoint> {
        let checkpoint = if is_local(request.model) {
            CheckpointConfig::read(Path::new(request.model))?
        } else {
            CheckpointConfig::default()
        };
        let arch = checkpoint.architecture(ByteTokenizer::VOCAB_SIZE)?;
        let budget = self.memory_budget.or(checkpoint.memory_budget_bytes);
        tracing::debug!(model = request.model, model_type = %arch.model_type, ?budget, "bigram checkpoint resolved");

        let model = BigramModel {
            name: request.model.to_string(),
            arch,
            precision: request.precision,
            max_seq_length: request.max_seq_length,
            budget,
            vocab: ByteTokenizer::VOCAB_SIZE,
            adapter: None,
            template: None,
            optimizer: None,
            last_activation: 0,
        };
        Ok(LoadedCheckpoint { model: Box::new(model), tokenizer: Arc::new(ByteTokenizer) })
    }
}

/// Parameters with their gradient and optimizer moments, stored row-major as
/// `rows x rank`.
#[derive(Debug, Clone)]
struct Factor {
    value: Vec<f32>,
    grad: Vec<f32>,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Factor {
    fn new(value: Vec<f32>) -> Self {
        let n = value.len();
        Self { value, grad: vec![0.0; n], m: vec![0.0; n], v: vec![0.0; n] }
    }

    fn extend(&mut self, values: impl IntoIterator<Item = f32>) {
        self.value.extend(values);
        let n = self.value.len();
        self.grad.resize(n, 0.0);
        self.m.resize(n, 0.0);
        self.v.resize(n, 0.0);
    }

    fn reset_moments(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
    }

    fn sgd(&mut self, lr: f32, weight_decay: f32, scale: f32) {
        for (p, g) in self.value.iter_mut().zip(&mut self.grad) {
            *p -= lr * (*g * scale + weight_decay * *p);
            *g = 0.0;
        }
    }

    fn adamw(&mut self, lr: f32, weight_decay: f32, scale: f32, t: i32) {
        let c1 = 1.0 - ADAM_BETA1.powi(t);
        let c2 = 1.0 - ADAM_BETA2.powi(t);
        for i in 0..self.value.len() {
            let g = self.grad[i] * scale;
            self.m[i] = ADAM_BETA1 * self.m[i] + (1.0 - ADAM_BETA1) * g;
            self.v[i] = ADAM_BETA2 * self.v[i] + (1.0 - ADAM_BETA2) * g * g;
            let update = (self.m[i] / c1) / ((self.v[i] / c2).sqrt() + ADAM_EPS);
            self.value[i] -= lr * (update + weight_decay * self.value[i]);
            self.grad[i] = 0.0;
        }
    }
}

#[derive(Debug)]
struct Adapter {
    spec: AdapterSpec,
    targets: Vec<String>,
    trainable: u64,
    rank: usize,
    scaling: f32,
    rng: StdRng,
    /// `A`: one row per previous token.
    a: Factor,
    /// `B` transposed: one row per next token.
    b: Factor,
    accumulated: u32,
    updates: i32,
}

impl Adapter {
    fn random_rows(rng: &mut StdRng, rows: usize, rank: usize) -> Vec<f32> {
        let bound = 1.0 / (rank as f32).sqrt();
        (0..rows * rank).map(|_| rng.gen_range(-bound..bound)).collect()
    }

    fn grow(&mut self, from: usize, to: usize) {
        let rows = Self::random_rows(&mut self.rng, to - from, self.rank);
        self.a.extend(rows);
        self.b.extend(std::iter::repeat_n(0.0, (to - from) * self.rank));
    }

    fn logit(&self, prev: usize, next: usize) -> f32 {
        let r = self.rank;
        let a = &self.a.value[prev * r..(prev + 1) * r];
        let b = &self.b.value[next * r..(next + 1) * r];
        self.scaling * a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>()
    }

    /// Accumulate cross-entropy gradients for predicting `next` after `prev`.
    /// Returns the token loss.
    fn accumulate(&mut self, prev: usize, next: usize, vocab: usize, weight: f32) -> f64 {
        let r = self.rank;
        let logits: Vec<f32> = (0..vocab).map(|j| self.logit(prev, j)).collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let loss = f64::from(-((exp[next] / sum).ln()));

        let Self { a, b, scaling, .. } = self;
        let a_row = a.value[prev * r..(prev + 1) * r].to_vec();
        for j in 0..vocab {
            let mut d = exp[j] / sum;
            if j == next {
                d -= 1.0;
            }
            let d = d * weight * *scaling;
            for k in 0..r {
                a.grad[prev * r + k] += d * b.value[j * r + k];
                b.grad[j * r + k] += d * a_row[k];
            }
        }
        loss
    }

    /// Merged next-token logits, `vocab x vocab` row-major.
    fn merged(&self, vocab: usize) -> Vec<f32> {
        (0..vocab).flat_map(|i| (0..vocab).map(move |j| (i, j))).map(|(i, j)| self.logit(i, j)).collect()
    }
}

pub struct BigramModel {
    name: String,
    arch: Architecture,
    precision: PrecisionPolicy,
    max_seq_length: usize,
    budget: Option<u64>,
    vocab: usize,
    adapter: Option<Adapter>,
    template: Option<TemplateBinding>,
    optimizer: Option<OptimizerSpec>,
    last_activation: u64,
}

#[derive(Serialize)]
struct AdapterConfigFile<'a> {
    base_model_name_or_path: &'a str,
    peft_type: &'static str,
    task_type: &'static str,
    r: u32,
    lora_alpha: f64,
    lora_dropout: f64,
    target_modules: Vec<&'a str>,
    bias: BiasPolicy,
    use_rslora: bool,
}

#[derive(Serialize)]
struct AdapterWeightsFile<'a> {
    format: &'static str,
    vocab_size: usize,
    rank: usize,
    scaling: f32,
    steps: i32,
    a: &'a [f32],
    b_transposed: &'a [f32],
}

fn write_json(dir: &Path, name: &str, value: &impl Serialize) -> EngineResult<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(value)?)?;
    Ok(path)
}

/// Per-row 4-bit affine quantization: `(min, scale, packed nibbles as hex)` per row.
pub fn quantize_4bit(values: &[f32], row_len: usize) -> Vec<(f32, f32, String)> {
    values
        .chunks(row_len.max(1))
        .map(|row| {
            let min = row.iter().copied().fold(f32::INFINITY, f32::min);
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let scale = if max > min { (max - min) / 15.0 } else { 1.0 };
            let nibbles: Vec<u8> = row.iter().map(|x| ((x - min) / scale).round().clamp(0.0, 15.0) as u8).collect();
            let packed: Vec<u8> =
                nibbles.chunks(2).map(|p| p[0] | (p.get(1).copied().unwrap_or(0) << 4)).collect();
            (min, scale, hex::encode(packed))
        })
        .collect()
}

impl BigramModel {
    fn grow_vocab(&mut self, vocab: usize) {
        if vocab <= self.vocab {
            return;
        }
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.grow(self.vocab, vocab);
        }
        tracing::debug!(from = self.vocab, to = vocab, "vocabulary extended");
        self.vocab = vocab;
    }

    fn base_bytes(&self) -> u64 {
        (self.arch.total_parameters() as f64 * self.precision.bytes_per_weight()) as u64
    }

    fn adapter_bytes(&self) -> u64 {
        let Some(adapter) = &self.adapter else { return 0 };
        let optimizer = match self.optimizer.as_ref().map(|o| o.kind) {
            Some(OptimizerKind::Adamw) => 8,
            Some(OptimizerKind::Adamw8bit) => 2,
            Some(OptimizerKind::Sgd) | None => 0,
        };
        // weights + gradients + optimizer state
        adapter.trainable * (4 + 4 + optimizer)
    }

    fn activation_bytes(&self, tokens: usize) -> u64 {
        let factor = match self.adapter.as_ref().map(|a| a.spec.gradient_checkpointing) {
            Some(GradientCheckpointing::Off) | None => 8,
            Some(GradientCheckpointing::On) => 2,
            Some(GradientCheckpointing::Offload) => 1,
        };
        (tokens * self.arch.hidden_size * self.arch.num_layers * 2) as u64 * factor
    }

    fn adapter(&self) -> EngineResult<&Adapter> {
        self.adapter.as_ref().ok_or_else(|| EngineError::Unsupported("no adapter attached".to_string()))
    }

    fn model_config(&self, dtype: &str) -> serde_json::Value {
        serde_json::json!({
            "model_type": self.arch.model_type,
            "hidden_size": self.arch.hidden_size,
            "num_hidden_layers": self.arch.num_layers,
            "vocab_size": self.vocab,
            "max_position_embeddings": self.max_seq_length,
            "torch_dtype": dtype,
            "chat_template": self.template.as_ref().map(|t| t.template.name()),
        })
    }
}

impl LoadedModel for BigramModel {
    fn architecture(&self) -> &Architecture {
        &self.arch
    }

    fn precision(&self) -> PrecisionPolicy {
        self.precision
    }

    fn attach_adapter(&mut self, spec: &AdapterSpec, modules: &[String]) -> EngineResult<u64> {
        if spec.rank == 0 {
            return Err(EngineError::Unsupported("adapter rank must be positive".to_string()));
        }
        let rank = spec.rank as usize;
        let mut trainable = 0u64;
        for path in modules {
            let module = self
                .arch
                .modules
                .iter()
                .find(|m| &m.path == path)
                .ok_or_else(|| EngineError::Incompatible(format!("no module `{path}`")))?;
            trainable += (rank * (module.in_features + module.out_features)) as u64;
            if spec.bias != BiasPolicy::None {
                trainable += module.out_features as u64;
            }
        }

        let mut rng = StdRng::seed_from_u64(spec.seed);
        let a = Adapter::random_rows(&mut rng, self.vocab, rank);
        self.adapter = Some(Adapter {
            spec: spec.clone(),
            targets: modules.to_vec(),
            trainable,
            rank,
            scaling: spec.scaling() as f32,
            rng,
            a: Factor::new(a),
            b: Factor::new(vec![0.0; self.vocab * rank]),
            accumulated: 0,
            updates: 0,
        });
        Ok(trainable)
    }

    fn detach_adapter(&mut self) {
        self.adapter = None;
    }

    fn set_template(&mut self, binding: &TemplateBinding) {
        let needed = binding.special_tokens.values().max().map_or(0, |max| *max as usize + 1);
        self.grow_vocab(needed);
        self.template = Some(binding.clone());
    }

    fn configure_optimizer(&mut self, spec: &OptimizerSpec) -> EngineResult<()> {
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.a.reset_moments();
            adapter.b.reset_moments();
            adapter.updates = 0;
        }
        self.optimizer = Some(spec.clone());
        Ok(())
    }

    fn forward_backward(&mut self, batch: &MicroBatch) -> EngineResult<f64> {
        let needed = batch.sequences.iter().flat_map(|s| &s.input_ids).max().map_or(0, |id| *id as usize + 1);
        self.grow_vocab(needed);

        let tokens: usize = batch.sequences.iter().map(|s| s.input_ids.len()).sum();
        let activation = self.activation_bytes(tokens);
        let requested = self.base_bytes() + self.adapter_bytes() + activation;
        if let Some(budget) = self.budget {
            if requested > budget {
                return Err(EngineError::OutOfMemory { requested, available: budget });
            }
        }
        self.last_activation = activation;

        let vocab = self.vocab;
        let adapter = self.adapter.as_mut().ok_or_else(|| EngineError::Unsupported("no adapter attached".to_string()))?;
        adapter.accumulated += 1;

        let supervised = batch.supervised_tokens();
        if supervised == 0 {
            return Ok(0.0);
        }
        let weight = 1.0 / supervised as f32;

        let mut loss = 0.0;
        for sequence in &batch.sequences {
            for t in 1..sequence.input_ids.len() {
                if let Some(Some(next)) = sequence.labels.get(t) {
                    let prev = sequence.input_ids[t - 1] as usize;
                    loss += adapter.accumulate(prev, *next as usize, vocab, weight);
                }
            }
        }
        Ok(loss / supervised as f64)
    }

    fn optimizer_step(&mut self, learning_rate: f64) -> EngineResult<()> {
        let spec = self.optimizer.clone().ok_or_else(|| EngineError::Unsupported("optimizer not configured".to_string()))?;
        let adapter = self.adapter.as_mut().ok_or_else(|| EngineError::Unsupported("no adapter attached".to_string()))?;

        let scale = 1.0 / adapter.accumulated.max(1) as f32;
        let (lr, wd) = (learning_rate as f32, spec.weight_decay as f32);
        adapter.updates += 1;
        match spec.kind {
            OptimizerKind::Sgd => {
                adapter.a.sgd(lr, wd, scale);
                adapter.b.sgd(lr, wd, scale);
            }
            OptimizerKind::Adamw | OptimizerKind::Adamw8bit => {
                adapter.a.adamw(lr, wd, scale, adapter.updates);
                adapter.b.adamw(lr, wd, scale, adapter.updates);
            }
        }
        adapter.accumulated = 0;
        Ok(())
    }

    fn memory(&self) -> MemorySnapshot {
        let resident = self.base_bytes() + self.adapter_bytes();
        MemorySnapshot { resident_bytes: resident, reserved_bytes: resident + self.last_activation }
    }

    fn save_adapter(&self, dir: &Path) -> EngineResult<SavedFiles> {
        let adapter = self.adapter()?;
        std::fs::create_dir_all(dir)?;

        let mut targets: Vec<&str> = adapter.targets.iter().map(|t| t.rsplit('.').next().unwrap_or(t)).collect();
        targets.sort_unstable();
        targets.dedup();

        let config = AdapterConfigFile {
            base_model_name_or_path: &self.name,
            peft_type: "LORA",
            task_type: "CAUSAL_LM",
            r: adapter.spec.rank,
            lora_alpha: adapter.spec.alpha,
            lora_dropout: adapter.spec.dropout,
            target_modules: targets,
            bias: adapter.spec.bias,
            use_rslora: adapter.spec.use_rslora,
        };
        let weights = AdapterWeightsFile {
            format: "ferment-bigram-lora",
            vocab_size: self.vocab,
            rank: adapter.rank,
            scaling: adapter.scaling,
            steps: adapter.updates,
            a: &adapter.a.value,
            b_transposed: &adapter.b.value,
        };
        Ok(vec![write_json(dir, "adapter_config.json", &config)?, write_json(dir, "adapter_model.json", &weights)?])
    }

    fn save_merged(&self, dir: &Path, precision: MergePrecision) -> EngineResult<SavedFiles> {
        let adapter = self.adapter()?;
        std::fs::create_dir_all(dir)?;
        let merged = adapter.merged(self.vocab);

        let (dtype, weights) = match precision {
            MergePrecision::Half => ("float16", serde_json::json!({ "logits": merged })),
            MergePrecision::LowBit => {
                let rows: Vec<serde_json::Value> = quantize_4bit(&merged, self.vocab)
                    .into_iter()
                    .map(|(min, scale, packed)| serde_json::json!({ "min": min, "scale": scale, "q4": packed }))
                    .collect();
                ("uint4", serde_json::json!({ "rows": rows }))
            }
        };
        let config = self.model_config(dtype);
        Ok(vec![write_json(dir, "config.json", &config)?, write_json(dir, "model.json", &weights)?])
    }

    fn save_interchange(&self, dir: &Path, quantization: &str) -> EngineResult<SavedFiles> {
        let file_type = gguf::file_type(quantization)
            .ok_or_else(|| EngineError::Unsupported(format!("unknown interchange quantization `{quantization}`")))?;
        std::fs::create_dir_all(dir)?;

        let arch = self.arch.model_type.as_str();
        let metadata = [
            ("general.architecture", gguf::Value::Str(arch.to_string())),
            ("general.name", gguf::Value::Str(self.name.clone())),
            ("general.file_type", gguf::Value::U32(file_type)),
            ("bigram.vocab_size", gguf::Value::U32(self.vocab as u32)),
            ("bigram.block_count", gguf::Value::U32(self.arch.num_layers as u32)),
            ("bigram.context_length", gguf::Value::U32(self.max_seq_length as u32)),
            (
                "tokenizer.chat_template",
                gguf::Value::Str(self.template.as_ref().map_or("", |t| t.template.name()).to_string()),
            ),
        ];

        let path = dir.join(format!("model-{}.gguf", quantization.to_ascii_lowercase()));
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        gguf::write(&mut file, &metadata)?;
        std::io::Write::flush(&mut file)?;
        Ok(vec![path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferment_training::config::{AdapterConfig, DType, Quantization, TrainingConfig};
    use ferment_training::engine::TrainSequence;
    use tempfile::TempDir;

    fn load(engine: BigramEngine) -> Box<dyn LoadedModel> {
        let request = LoadRequest {
            model: "org/tiny",
            max_seq_length: 128,
            precision: PrecisionPolicy::resolve(DType::Auto, Quantization::Nf4),
            token: None,
        };
        engine.load(&request).unwrap().model
    }

    fn attach(model: &mut Box<dyn LoadedModel>) -> u64 {
        let spec = AdapterSpec::from(&AdapterConfig { rank: 4, ..AdapterConfig::default() });
        let targets: Vec<String> = model.architecture().modules_named("q_proj").map(|m| m.path.clone()).collect();
        model.attach_adapter(&spec, &targets).unwrap()
    }

    fn batch() -> MicroBatch {
        let ids: Vec<u32> = "hello hello hello".bytes().map(u32::from).collect();
        let labels = ids.iter().enumerate().map(|(i, id)| (i >= 6).then_some(*id)).collect();
        MicroBatch { sequences: vec![TrainSequence { input_ids: ids, labels }] }
    }

    #[test]
    fn test_loss_decreases_with_training() {
        let mut model = load(BigramEngine::new());
        attach(&mut model);
        let spec = OptimizerSpec { kind: OptimizerKind::Adamw, weight_decay: 0.0, seed: 1 };
        model.configure_optimizer(&spec).unwrap();

        let first = model.forward_backward(&batch()).unwrap();
        assert!((first - (256f64).ln()).abs() < 1e-3);
        model.optimizer_step(0.05).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = model.forward_backward(&batch()).unwrap();
            model.optimizer_step(0.05).unwrap();
        }
        assert!(last < first * 0.8, "loss {first} -> {last}");
    }

    #[test]
    fn test_trainable_parameters_follow_target_shapes() {
        let mut model = load(BigramEngine::new());
        // 2 layers x q_proj(64 -> 64) x rank 4
        assert_eq!(attach(&mut model), 2 * 4 * 128);
    }

    #[test]
    fn test_memory_budget_raises_out_of_memory() {
        let mut model = load(BigramEngine::new().with_memory_budget(1024));
        attach(&mut model);
        model.configure_optimizer(&OptimizerSpec::from(&TrainingConfig::default())).unwrap();

        let err = model.forward_backward(&batch()).unwrap_err();
        assert!(matches!(err, EngineError::OutOfMemory { available: 1024, .. }));
    }

    #[test]
    fn test_saves_write_expected_files() {
        let temp = TempDir::new().unwrap();
        let mut model = load(BigramEngine::new());
        attach(&mut model);

        let adapter = model.save_adapter(&temp.path().join("adapter")).unwrap();
        assert_eq!(adapter.len(), 2);
        let config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(temp.path().join("adapter/adapter_config.json")).unwrap()).unwrap();
        assert_eq!(config["target_modules"], serde_json::json!(["q_proj"]));

        model.save_merged(&temp.path().join("merged"), MergePrecision::LowBit).unwrap();
        let gguf = model.save_interchange(&temp.path().join("gguf"), "q4_k_m").unwrap();
        assert!(std::fs::read(&gguf[0]).unwrap().starts_with(b"GGUF"));
        assert!(model.save_interchange(&temp.path().join("bad"), "q1").is_err());
    }

    #[test]
    fn test_quantize_4bit_error_is_bounded() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
        let rows = quantize_4bit(&values, 16);
        assert_eq!(rows.len(), 2);

        let (min, scale, packed) = &rows[0];
        let bytes = hex::decode(packed).unwrap();
        for (i, x) in values[..16].iter().enumerate() {
            let nibble = (bytes[i / 2] >> (4 * (i % 2))) & 0x0f;
            let restored = min + f32::from(nibble) * scale;
            assert!((restored - x).abs() <= scale / 2.0 + 1e-6);
        }
    }
}
