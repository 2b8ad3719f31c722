use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Filesystem layout of one run under `training.output_dir`.
///
/// ```text
/// <output_dir>/
///   checkpoint-<step>/      adapter weights + trainer_state.json
///   trainer_state.json      run summary, written at run end
///   metrics.jsonl           step metrics (report_to = jsonl)
///   dataset.jsonl           rendered training text
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self { root: output_dir.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    #[must_use]
    pub fn trainer_state_path(&self) -> PathBuf {
        self.root.join("trainer_state.json")
    }

    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.root.join("metrics.jsonl")
    }

    #[must_use]
    pub fn dataset_jsonl_path(&self) -> PathBuf {
        self.root.join("dataset.jsonl")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Existing checkpoint directories, oldest step first.
    pub fn checkpoints(&self) -> TrainingResult<Vec<(u64, PathBuf)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let step = name.to_str().and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX)).and_then(|s| s.parse().ok());
            if let Some(step) = step {
                found.push((step, entry.path()));
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    /// Delete the oldest checkpoints so that at most `limit` remain. Returns the
    /// removed directories.
    pub fn rotate_checkpoints(&self, limit: usize) -> TrainingResult<Vec<PathBuf>> {
        let checkpoints = self.checkpoints()?;
        let excess = checkpoints.len().saturating_sub(limit);

        let mut removed = Vec::with_capacity(excess);
        for (step, path) in checkpoints.into_iter().take(excess) {
            tracing::warn!(step, path = %path.display(), "removing old checkpoint");
            std::fs::remove_dir_all(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}
