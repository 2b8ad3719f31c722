//! One job, end to end: resolve, assemble, prepare, train, export, publish.

use crate::console::{self, Console};
use ferment_training::config::ExportConfig;
use ferment_training::{
    prepare_dataset, AdapterModel, AdapterSpec, ArtifactExporter, ConfigError, DatasetError, DatasetReport, ExportOutcome,
    ExportReport, HttpPublisher, JobConfig, ModelAssembler, ModelError, Observers, Override, PreparedDataset,
    ProgressObserver, PublishError, PublishedArtifact, Publisher, RunSummary, StopHandle, TracingObserver, TrainingError,
    TrainingOrchestrator, Violation,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const EXIT_CONFIG: u8 = 3;
pub const EXIT_RUNTIME: u8 = 4;
pub const EXIT_PARTIAL_EXPORT: u8 = 5;
pub const EXIT_EXPORT_FAILED: u8 = 6;
pub const EXIT_PUBLISH: u8 = 7;

#[derive(Debug, Clone)]
pub struct Options {
    pub config: PathBuf,
    pub overrides: Vec<String>,
    pub show_config: bool,
    pub no_save: bool,
    pub project_root: PathBuf,
    pub json: bool,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown engine `{name}`; available: {}", available.join(", "))]
    UnknownEngine { name: String, available: Vec<&'static str> },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error("training task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Output(#[from] serde_json::Error),
}

impl JobError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::UnknownEngine { .. } => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Config(err) => err.violations(),
            _ => &[],
        }
    }
}

/// What a successful invocation produced.
#[derive(Debug, Default)]
pub struct JobReport {
    pub dataset: Option<DatasetReport>,
    pub summary: Option<RunSummary>,
    pub export: Option<ExportReport>,
    pub published: Vec<PublishedArtifact>,
    pub publish_error: Option<PublishError>,
}

impl JobReport {
    pub fn exit_code(&self) -> u8 {
        match self.export.as_ref().map(ExportReport::outcome) {
            Some(ExportOutcome::Partial) => EXIT_PARTIAL_EXPORT,
            Some(ExportOutcome::Failed) => EXIT_EXPORT_FAILED,
            _ if self.publish_error.is_some() => EXIT_PUBLISH,
            _ => 0,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "dataset": self.dataset,
            "run": self.summary,
            "export": self.export,
            "published": self.published.iter().map(|p| &p.location).collect::<Vec<_>>(),
            "publish_error": self.publish_error.as_ref().map(ToString::to_string),
        })
    }
}

pub async fn execute(options: Options) -> Result<JobReport, JobError> {
    let overrides = options.overrides.iter().map(|raw| Override::parse(raw)).collect::<Result<Vec<_>, _>>()?;
    let config = Arc::new(JobConfig::resolve(&options.config, &overrides, &options.project_root)?);

    if options.show_config {
        print!("{}", config.to_yaml()?);
        return Ok(JobReport::default());
    }

    let engine = ferment_engine::engine_for(&config.model.engine).ok_or_else(|| JobError::UnknownEngine {
        name: config.model.engine.clone(),
        available: ferment_engine::ENGINES.to_vec(),
    })?;

    let assembler = ModelAssembler::new(config.clone(), engine);
    let loaded = assembler.load_base(&config.model)?;
    let mut model = assembler.attach_adapter(loaded.model, &AdapterSpec::from(&config.adapter))?;
    assembler.apply_chat_template_metadata(&mut model, &loaded.tokenizer, &config.template)?;
    if config.monitoring.show_memory_stats {
        let memory = assembler.report_memory(&model);
        tracing::info!(
            resident_gib = memory.resident_gib(),
            reserved_gib = memory.reserved_gib(),
            "model ready"
        );
    }

    let (dataset, dataset_report) = prepare_dataset(&config, &loaded.tokenizer)?;
    if !options.json {
        console::print_dataset(&dataset_report);
    }

    let stop = StopHandle::default();
    let interrupt = tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current step");
                stop.stop();
            }
        }
    });

    // The progress bar is hidden under --json; step events then go to the log.
    let mut observers = Observers::new().with(Box::new(Console::new(options.json, config.monitoring.show_memory_stats)));
    if options.json {
        observers.push(Box::new(TracingObserver));
    }
    let save = !options.no_save;
    let training = tokio::task::spawn_blocking({
        let config = config.clone();
        move || train_and_export(&config, model, dataset, stop, &observers, save)
    });
    let outcome = training.await;
    interrupt.abort();
    let (summary, mut export) = outcome??;

    let mut report = JobReport { dataset: Some(dataset_report), summary: Some(summary), ..JobReport::default() };
    if let Some(export) = export.as_mut() {
        if config.export.remote_push && export.outcome() != ExportOutcome::Failed {
            match publish(&config.export, export).await {
                Ok(published) => report.published = published,
                Err(err) => {
                    tracing::error!(error = %err, "publish failed; local artifacts are kept");
                    report.publish_error = Some(err);
                }
            }
        }
    }
    report.export = export;

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        if let Some(summary) = &report.summary {
            console::print_summary(summary);
        }
        if let Some(export) = &report.export {
            console::print_export(export);
        }
        console::print_published(&report.published);
        if let Some(err) = &report.publish_error {
            eprintln!("  publish failed: {err}");
        }
    }

    Ok(report)
}

fn train_and_export(
    config: &Arc<JobConfig>,
    mut model: AdapterModel,
    dataset: PreparedDataset,
    stop: StopHandle,
    observer: &dyn ProgressObserver,
    save: bool,
) -> Result<(RunSummary, Option<ExportReport>), JobError> {
    let mut orchestrator = TrainingOrchestrator::new(config.clone(), &mut model).with_stop_handle(stop);
    let plan = *orchestrator.build(dataset)?;
    tracing::info!(steps = plan.total_steps, examples = plan.examples, "training plan ready");

    let summary = orchestrator.train(observer)?;
    if !save {
        tracing::info!("export skipped (--no-save)");
        return Ok((summary, None));
    }

    let run = orchestrator.exportable()?;
    let export = ArtifactExporter::new().export(&run, &config.export);
    Ok((summary, Some(export)))
}

async fn publish(config: &ExportConfig, report: &mut ExportReport) -> Result<Vec<PublishedArtifact>, PublishError> {
    let publisher = HttpPublisher::from_config(config);
    let destination = config.remote_id.clone().unwrap_or_default();
    let mut published = Vec::with_capacity(report.artifacts.len());
    for artifact in &mut report.artifacts {
        let remote = publisher.publish(artifact, &destination).await?;
        artifact.remote = Some(remote.location.clone());
        published.push(remote);
    }
    Ok(published)
}
