use crate::export::ExportMethod;
use crate::orchestrator::{RunId, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MANIFEST_FILE: &str = "export_manifest.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the artifact directory, `/`-separated.
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

/// One exported format on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub method: ExportMethod,
    pub dir: PathBuf,
    pub files: Vec<ArtifactFile>,
    pub run_id: RunId,
    /// Optimizer step the weights were taken at.
    pub step: u64,
    /// Remote location, once published.
    pub remote: Option<String>,
}

impl ExportArtifact {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub method: ExportMethod,
    pub run_id: RunId,
    pub run_state: RunState,
    pub step: u64,
    pub base_model: String,
    pub template: Option<String>,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ArtifactFile>,
}

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash every regular file under `dir` except the manifest itself, sorted by path.
pub fn collect_files(dir: &Path) -> std::io::Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).map_err(std::io::Error::other)?;
        let rel = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect::<Vec<_>>().join("/");
        if rel == MANIFEST_FILE {
            continue;
        }
        files.push(ArtifactFile {
            path: rel,
            bytes: entry.metadata().map_err(std::io::Error::other)?.len(),
            sha256: sha256_file(entry.path())?,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

pub fn write_manifest(dir: &Path, manifest: &ExportManifest) -> std::io::Result<PathBuf> {
    let path = dir.join(MANIFEST_FILE);
    let body = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_files_hashes_nested_and_skips_manifest() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("b.bin"), b"abc").unwrap();
        std::fs::write(temp.path().join("sub/a.json"), b"{}").unwrap();
        std::fs::write(temp.path().join(MANIFEST_FILE), b"{}").unwrap();

        let files = collect_files(temp.path()).unwrap();

        assert_eq!(files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["b.bin", "sub/a.json"]);
        assert_eq!(files[0].bytes, 3);
        assert_eq!(files[0].sha256, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }
}
