//! Ferment Training
//!
//! Backend-agnostic orchestration for low-rank adapter fine-tuning:
//! - Resolving job configurations (`JobConfig`)
//! - Preparing chat datasets with assistant-only loss masks
//! - Assembling a base model with adapters and chat-template metadata
//! - Running training as a state machine (`TrainingOrchestrator`)
//! - Exporting and publishing artifacts in several formats
//!
//! Numerics live behind the `TrainingEngine` / `LoadedModel` / `Tokenizer` traits.

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod export;
pub mod layout;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod publish;
pub mod template;
pub mod tokenizer;

pub use artifacts::{ArtifactFile, ExportArtifact, ExportManifest};
pub use config::{JobConfig, Override};
pub use dataset::{prepare_dataset, DatasetId, DatasetReport, FormattedExample, PreparedDataset};
pub use engine::{LoadedModel, MemorySnapshot, TrainingEngine};
pub use error::{
    ConfigError, ConfigResult, DatasetError, DatasetResult, EngineError, EngineResult, ExportError, ModelError,
    ModelResult, PublishError, PublishResult, TrainingError, TrainingResult, Violation,
};
pub use export::{ArtifactExporter, ExportMethod, ExportOutcome, ExportReport, ExportStrategy};
pub use layout::RunLayout;
pub use model::{AdapterModel, AdapterSpec, BaseModel, LoadedBase, ModelAssembler, PrecisionPolicy};
pub use orchestrator::{ExportableRun, RunId, RunState, RunSummary, StopHandle, TrainingOrchestrator, TrainingRun};
pub use progress::{CollectingObserver, Observers, ProgressEvent, ProgressObserver, ReportSink, TracingObserver};
pub use publish::{HttpPublisher, PublishedArtifact, Publisher};
pub use template::ChatTemplate;
pub use tokenizer::{ChatTokenizer, TemplateBinding, Tokenizer};
