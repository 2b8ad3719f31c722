use crate::export::ExportMethod;
use crate::orchestrator::RunState;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type DatasetResult<T> = std::result::Result<T, DatasetError>;
pub type ModelResult<T> = std::result::Result<T, ModelError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
pub type TrainingResult<T> = std::result::Result<T, TrainingError>;
pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// A single problem found while validating a job configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field (e.g. `training.batch_size`).
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(String),

    #[error("failed to parse configuration {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration ({} problem(s)): {}", .0.len(), join_violations(.0))]
    Validation(Vec<Violation>),

    #[error("invalid override `{key}`: {message}")]
    Override { key: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Every violation carried by a validation failure (empty for other kinds).
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to load dataset {path}: {message}")]
    Load { path: String, message: String },

    #[error("record {record}: {message}")]
    Schema { record: usize, message: String },

    #[error("record {record}: failed to render chat template: {message}")]
    Template { record: usize, message: String },

    #[error("tokenizer has no chat template; apply the template metadata before formatting")]
    TemplateUnset,

    #[error("dataset is empty after filtering ({skipped} of {total} record(s) rejected)")]
    Empty { total: usize, skipped: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DatasetError {
    /// Index of the offending record, when the error is tied to one.
    pub fn record(&self) -> Option<usize> {
        match self {
            Self::Schema { record, .. } | Self::Template { record, .. } => Some(*record),
            _ => None,
        }
    }
}

/// Failures raised by an engine implementation (the numerics behind the traits).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("incompatible checkpoint: {0}")]
    Incompatible(String),

    #[error("out of memory: requested {requested} bytes with {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("engine failure: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load base model `{model}`: {source}")]
    Load {
        model: String,
        #[source]
        source: EngineError,
    },

    #[error("unknown engine `{0}`")]
    UnknownEngine(String),

    #[error("adapter target module(s) not found on {architecture}: {}; available: {}", missing.join(", "), available.join(", "))]
    AdapterConfig { architecture: String, missing: Vec<String>, available: Vec<String> },

    #[error("chat template already set to `{current}`, refusing to switch to `{requested}`")]
    TemplateConflict { current: String, requested: String },

    #[error("unknown chat template `{0}`")]
    UnknownTemplate(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("cannot {operation} while run is {from}")]
    InvalidState { from: RunState, operation: &'static str },

    #[error("cannot export from a failed run: {cause}")]
    ExportFromFailedRun { cause: String },

    #[error("training plan is empty: {0}")]
    EmptyPlan(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure to produce one export format. Other formats are unaffected.
#[derive(Debug, Error, Serialize)]
#[error("export `{method}` failed: {message}")]
pub struct ExportError {
    pub method: ExportMethod,
    pub message: String,
}

impl ExportError {
    pub fn new(method: ExportMethod, message: impl Into<String>) -> Self {
        Self { method, message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("authentication failed for {destination}: {message}")]
    Auth { destination: String, message: String },

    #[error("network error while publishing to {destination}: {message}")]
    Network { destination: String, message: String },

    #[error("remote rejected {file}: HTTP {status}")]
    Rejected { file: String, status: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
