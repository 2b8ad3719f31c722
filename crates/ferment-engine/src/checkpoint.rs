use ferment_training::engine::{Architecture, ModuleInfo};
use ferment_training::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// `config.json` of a local checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub model_type: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    /// Device memory available to the run; unlimited when absent.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            model_type: "llama".to_string(),
            hidden_size: 64,
            intermediate_size: 172,
            num_hidden_layers: 2,
            memory_budget_bytes: None,
        }
    }
}

impl CheckpointConfig {
    pub fn read(dir: &Path) -> EngineResult<Self> {
        if !dir.is_dir() {
            return Err(EngineError::CheckpointNotFound(dir.display().to_string()));
        }
        let path = dir.join("config.json");
        let body = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Incompatible(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&body)
            .map_err(|e| EngineError::Incompatible(format!("{}: {e}", path.display())))?;
        if config.hidden_size == 0 || config.num_hidden_layers == 0 {
            return Err(EngineError::Incompatible(format!("{}: empty architecture", path.display())));
        }
        Ok(config)
    }

    /// Module layout for the model family.
    pub fn architecture(&self, vocab_size: usize) -> EngineResult<Architecture> {
        let (h, i) = (self.hidden_size, self.intermediate_size.max(1));
        let per_layer: Vec<(&str, usize, usize)> = match self.model_type.as_str() {
            "llama" | "mistral" | "qwen2" | "qwen3" | "gemma" => vec![
                ("self_attn.q_proj", h, h),
                ("self_attn.k_proj", h, h),
                ("self_attn.v_proj", h, h),
                ("self_attn.o_proj", h, h),
                ("mlp.gate_proj", h, i),
                ("mlp.up_proj", h, i),
                ("mlp.down_proj", i, h),
            ],
            "gpt2" => vec![("attn.c_attn", h, 3 * h), ("attn.c_proj", h, h), ("mlp.c_fc", h, i), ("mlp.c_proj", i, h)],
            other => return Err(EngineError::Incompatible(format!("unsupported model_type `{other}`"))),
        };

        let modules = (0..self.num_hidden_layers)
            .flat_map(|layer| {
                per_layer.iter().map(move |(name, in_features, out_features)| ModuleInfo {
                    path: format!("model.layers.{layer}.{name}"),
                    in_features: *in_features,
                    out_features: *out_features,
                })
            })
            .collect();

        Ok(Architecture {
            model_type: self.model_type.clone(),
            hidden_size: h,
            num_layers: self.num_hidden_layers,
            vocab_size,
            modules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reads_local_config() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), r#"{"model_type": "gpt2", "hidden_size": 8, "num_hidden_layers": 1}"#)
            .unwrap();

        let config = CheckpointConfig::read(temp.path()).unwrap();
        let arch = config.architecture(256).unwrap();

        assert_eq!(arch.module_names(), vec!["c_attn", "c_fc", "c_proj"]);
        assert_eq!(arch.modules.len(), 4);
    }

    #[test]
    fn test_missing_and_broken_checkpoints() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            CheckpointConfig::read(&temp.path().join("nope")),
            Err(EngineError::CheckpointNotFound(_))
        ));
        assert!(matches!(CheckpointConfig::read(temp.path()), Err(EngineError::Incompatible(_))));

        let bert = CheckpointConfig { model_type: "bert".to_string(), ..CheckpointConfig::default() };
        assert!(bert.architecture(256).is_err());
    }
}
