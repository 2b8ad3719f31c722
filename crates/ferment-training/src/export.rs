//! Multi-format export of a finished run.
//!
//! Every requested format is attempted on its own; one format failing never
//! prevents the others. Each artifact directory holds the engine-written weights,
//! a `tokenizer_config.json` carrying the chat template, and an
//! `export_manifest.json` listing every file with its sha256.

use crate::artifacts::{collect_files, write_manifest, ExportArtifact, ExportManifest, TOKENIZER_CONFIG_FILE};
use crate::config::ExportConfig;
use crate::engine::{MergePrecision, SavedFiles};
use crate::error::ExportError;
use crate::orchestrator::ExportableRun;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMethod {
    /// Adapter weights only.
    #[serde(alias = "lora")]
    Adapter,
    /// Adapter merged into 16-bit base weights.
    #[serde(alias = "merged_16bit")]
    MergedFp,
    /// Adapter merged into 4-bit quantized weights.
    #[serde(alias = "merged_4bit")]
    MergedLowbit,
    /// Quantized single-file interchange format for local inference runtimes.
    #[serde(alias = "gguf")]
    Interchange,
}

impl ExportMethod {
    pub const ALL: [Self; 4] = [Self::Adapter, Self::MergedFp, Self::MergedLowbit, Self::Interchange];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adapter => "adapter",
            Self::MergedFp => "merged_fp",
            Self::MergedLowbit => "merged_lowbit",
            Self::Interchange => "interchange",
        }
    }

    pub fn strategy(self, config: &ExportConfig) -> ExportStrategy {
        match self {
            Self::Adapter => ExportStrategy::Adapter,
            Self::MergedFp => ExportStrategy::MergedFullPrecision,
            Self::MergedLowbit => ExportStrategy::MergedLowBit,
            Self::Interchange => ExportStrategy::Interchange { quantization: config.interchange_quantization.clone() },
        }
    }
}

impl fmt::Display for ExportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStrategy {
    Adapter,
    MergedFullPrecision,
    MergedLowBit,
    Interchange { quantization: String },
}

impl ExportStrategy {
    pub fn method(&self) -> ExportMethod {
        match self {
            Self::Adapter => ExportMethod::Adapter,
            Self::MergedFullPrecision => ExportMethod::MergedFp,
            Self::MergedLowBit => ExportMethod::MergedLowbit,
            Self::Interchange { .. } => ExportMethod::Interchange,
        }
    }

    /// Write this format for `run` into `dir`.
    pub fn export(&self, run: &ExportableRun<'_>, dir: &Path) -> Result<ExportArtifact, ExportError> {
        let method = self.method();
        let fail = |message: String| ExportError::new(method, message);

        if dir.is_file() {
            return Err(fail(format!("destination {} is a file", dir.display())));
        }
        std::fs::create_dir_all(dir).map_err(|e| fail(format!("cannot create {}: {e}", dir.display())))?;

        let engine = run.model.engine();
        let saved: SavedFiles = match self {
            Self::Adapter => engine.save_adapter(dir),
            Self::MergedFullPrecision => engine.save_merged(dir, MergePrecision::Half),
            Self::MergedLowBit => engine.save_merged(dir, MergePrecision::LowBit),
            Self::Interchange { quantization } => engine.save_interchange(dir, quantization),
        }
        .map_err(|e| fail(e.to_string()))?;
        tracing::debug!(%method, files = saved.len(), "engine files written");

        let template = run.model.template();
        let tokenizer_config = serde_json::json!({
            "chat_template": template.map(|t| t.template.name()),
            "add_generation_prompt": template.is_some_and(|t| t.add_generation_prompt),
            "bos_token": template.and_then(|t| t.bos_token.clone()),
            "eos_token": template.map(|t| t.eos_token.clone()),
            "added_tokens": template.map(|t| t.special_tokens.clone()).unwrap_or_default(),
            "model_max_length": run.config.model.max_seq_length,
        });
        let body = serde_json::to_vec_pretty(&tokenizer_config).map_err(|e| fail(e.to_string()))?;
        std::fs::write(dir.join(TOKENIZER_CONFIG_FILE), body).map_err(|e| fail(e.to_string()))?;

        let files = collect_files(dir).map_err(|e| fail(format!("cannot hash files: {e}")))?;
        let manifest = ExportManifest {
            method,
            run_id: run.run.id.clone(),
            run_state: run.run.state,
            step: run.run.step,
            base_model: run.model.name().to_string(),
            template: template.map(|t| t.template.name().to_string()),
            created_at: Utc::now(),
            files: files.clone(),
        };
        write_manifest(dir, &manifest).map_err(|e| fail(format!("cannot write manifest: {e}")))?;

        Ok(ExportArtifact {
            method,
            dir: dir.to_path_buf(),
            files,
            run_id: run.run.id.clone(),
            step: run.run.step,
            remote: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOutcome {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug, Default, Serialize)]
pub struct ExportReport {
    pub artifacts: Vec<ExportArtifact>,
    pub failures: Vec<ExportError>,
}

impl ExportReport {
    pub fn outcome(&self) -> ExportOutcome {
        match (self.artifacts.is_empty(), self.failures.is_empty()) {
            (_, true) => ExportOutcome::Complete,
            (false, false) => ExportOutcome::Partial,
            (true, false) => ExportOutcome::Failed,
        }
    }

    pub fn artifact(&self, method: ExportMethod) -> Option<&ExportArtifact> {
        self.artifacts.iter().find(|a| a.method == method)
    }
}

#[derive(Debug, Default)]
pub struct ArtifactExporter;

impl ArtifactExporter {
    pub fn new() -> Self {
        Self
    }

    /// Attempt every requested method, collecting successes and failures.
    pub fn export(&self, run: &ExportableRun<'_>, spec: &ExportConfig) -> ExportReport {
        let output_dir = &run.config.training.output_dir;
        let mut report = ExportReport::default();

        for method in &spec.method {
            let dir = spec.destination(*method, output_dir);
            tracing::info!(%method, dir = %dir.display(), step = run.run.step, "exporting");

            match method.strategy(spec).export(run, &dir) {
                Ok(artifact) => {
                    tracing::info!(%method, files = artifact.files.len(), bytes = artifact.total_bytes(), "export complete");
                    report.artifacts.push(artifact);
                }
                Err(err) => {
                    tracing::warn!(%method, error = %err.message, "export failed");
                    report.failures.push(err);
                }
            }
        }
        report
    }
}
