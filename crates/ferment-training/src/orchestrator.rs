//! Supervised training as an explicit state machine.
//!
//! ```text
//! Configured --build--> Built --train--> Running --> Completed | Stopped | Failed
//! ```
//!
//! The orchestrator borrows the [`AdapterModel`] mutably for its whole lifetime,
//! so the weights are never copied and nothing else can touch them mid-run.
//! Cancellation goes through a [`StopHandle`], checked before every optimizer
//! step.

use crate::config::{JobConfig, SchedulerKind};
use crate::dataset::{DatasetId, FormattedExample, PreparedDataset};
use crate::engine::{MemorySnapshot, MicroBatch, OptimizerSpec, TrainSequence};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::model::AdapterModel;
use crate::progress::{ProgressEvent, ProgressObserver, ReportSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Configured,
    Built,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Built => "built",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossPoint {
    pub step: u64,
    pub loss: f64,
    pub learning_rate: f64,
}

/// Mutable record of one run. Owned by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: RunId,
    pub state: RunState,
    /// Number of completed optimizer updates.
    pub step: u64,
    pub losses: Vec<LossPoint>,
    pub memory: Vec<(u64, MemorySnapshot)>,
    pub checkpoints: Vec<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl TrainingRun {
    fn new() -> Self {
        Self {
            id: RunId::new(),
            state: RunState::Configured,
            step: 0,
            losses: Vec::new(),
            memory: Vec::new(),
            checkpoints: Vec::new(),
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.losses.last().map(|p| p.loss)
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.losses.iter().map(|p| p.loss).reduce(f64::min)
    }
}

/// Cloneable flag used to request a stop from another thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Learning-rate schedule with linear warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub kind: SchedulerKind,
    pub peak: f64,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl LrSchedule {
    /// Rate for the update that will complete `step` (1-based).
    pub fn at(&self, step: u64) -> f64 {
        let current = step.saturating_sub(1) as f64;
        let warmup = self.warmup_steps as f64;
        let total = self.total_steps as f64;

        if current < warmup {
            return self.peak * current / warmup.max(1.0);
        }
        let decay = (total - warmup).max(1.0);
        let progress = ((current - warmup) / decay).clamp(0.0, 1.0);
        match self.kind {
            SchedulerKind::Constant => self.peak,
            SchedulerKind::Linear => self.peak * (1.0 - progress),
            SchedulerKind::Cosine => self.peak * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        }
    }
}

/// Step budget derived from the dataset and the training section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub total_steps: u64,
    pub examples: usize,
    pub micro_batch: usize,
    pub grad_accum: usize,
}

impl TrainingPlan {
    pub fn examples_per_step(&self) -> usize {
        self.micro_batch * self.grad_accum
    }

    fn for_config(config: &JobConfig, examples: usize) -> TrainingResult<Self> {
        let training = &config.training;
        if examples == 0 {
            return Err(TrainingError::EmptyPlan("dataset has no examples".to_string()));
        }
        let micro_batch = training.batch_size.max(1);
        let grad_accum = training.grad_accum.max(1);
        let per_step = (micro_batch * grad_accum) as u64;

        let total_steps = match training.num_epochs {
            Some(epochs) => (examples as u64 * u64::from(epochs)).div_ceil(per_step),
            None => training.max_steps,
        };
        if total_steps == 0 {
            return Err(TrainingError::EmptyPlan("zero optimizer steps".to_string()));
        }

        Ok(Self { total_steps, examples, micro_batch, grad_accum })
    }
}

/// What a finished run reports, also written as `trainer_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub base_model: String,
    pub dataset_id: Option<DatasetId>,
    pub steps: u64,
    pub planned_steps: u64,
    pub final_loss: Option<f64>,
    pub best_loss: Option<f64>,
    pub trainable_parameters: u64,
    pub total_parameters: u64,
    pub peak_memory: Option<MemorySnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runtime_seconds: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
    pub failure: Option<String>,
    pub log_history: Vec<LossPoint>,
}

/// Read-only view of a finished run that may be exported.
pub struct ExportableRun<'a> {
    pub run: &'a TrainingRun,
    pub model: &'a AdapterModel,
    pub config: &'a JobConfig,
}

struct Emitter<'a> {
    observer: &'a dyn ProgressObserver,
    sink: Option<Box<dyn ProgressObserver>>,
}

impl Emitter<'_> {
    fn emit(&self, event: &ProgressEvent) {
        self.observer.on_event(event);
        if let Some(sink) = &self.sink {
            sink.on_event(event);
        }
    }
}

/// Early stopping on the training loss: stop once `patience` consecutive steps fail
/// to improve the best loss by more than `min_delta`.
#[derive(Debug)]
struct EarlyStopping {
    patience: u64,
    min_delta: f64,
    best: f64,
    stale: u64,
}

impl EarlyStopping {
    fn observe(&mut self, loss: f64) -> bool {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        self.stale >= self.patience
    }
}

enum Outcome {
    Finished,
    StopRequested,
    EarlyStopped,
}

pub struct TrainingOrchestrator<'m> {
    config: Arc<JobConfig>,
    model: &'m mut AdapterModel,
    layout: RunLayout,
    run: TrainingRun,
    stop: StopHandle,
    dataset: Option<PreparedDataset>,
    dataset_id: Option<DatasetId>,
    plan: Option<TrainingPlan>,
    schedule: Option<LrSchedule>,
}

impl<'m> TrainingOrchestrator<'m> {
    pub fn new(config: Arc<JobConfig>, model: &'m mut AdapterModel) -> Self {
        let layout = RunLayout::new(config.training.output_dir.clone());
        Self {
            config,
            model,
            layout,
            run: TrainingRun::new(),
            stop: StopHandle::default(),
            dataset: None,
            dataset_id: None,
            plan: None,
            schedule: None,
        }
    }

    /// Share a stop flag created before the orchestrator, e.g. by a signal handler.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> RunState {
        self.run.state
    }

    pub fn run(&self) -> &TrainingRun {
        &self.run
    }

    pub fn plan(&self) -> Option<&TrainingPlan> {
        self.plan.as_ref()
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn expect_state(&self, expected: RunState, operation: &'static str) -> TrainingResult<()> {
        if self.run.state == expected {
            Ok(())
        } else {
            Err(TrainingError::InvalidState { from: self.run.state, operation })
        }
    }

    /// Compute the step plan and wire the optimizer and schedule.
    pub fn build(&mut self, dataset: PreparedDataset) -> TrainingResult<&TrainingPlan> {
        self.expect_state(RunState::Configured, "build")?;

        let training = &self.config.training;
        let plan = TrainingPlan::for_config(&self.config, dataset.len())?;
        let schedule = LrSchedule {
            kind: training.scheduler,
            peak: training.learning_rate,
            warmup_steps: training.warmup_steps.min(plan.total_steps),
            total_steps: plan.total_steps,
        };

        self.model.engine_mut().configure_optimizer(&OptimizerSpec::from(training))?;
        self.layout.ensure_dirs()?;
        dataset.write_jsonl(&self.layout.dataset_jsonl_path(), &self.config.dataset.text_field)?;

        tracing::info!(
            run_id = %self.run.id,
            total_steps = plan.total_steps,
            examples = plan.examples,
            examples_per_step = plan.examples_per_step(),
            optimizer = ?training.optimizer,
            scheduler = ?training.scheduler,
            "training plan built"
        );

        self.dataset_id = Some(dataset.id().clone());
        self.dataset = Some(dataset);
        self.schedule = Some(schedule);
        self.run.state = RunState::Built;
        Ok(self.plan.insert(plan))
    }

    /// Run the plan to completion, a stop request, early stopping or failure.
    ///
    /// Engine failures end the run as `Failed`; the error is returned and also kept
    /// on the run.
    pub fn train(&mut self, observer: &dyn ProgressObserver) -> TrainingResult<RunSummary> {
        self.expect_state(RunState::Built, "train")?;
        let (Some(dataset), Some(plan), Some(schedule)) = (self.dataset.take(), self.plan, self.schedule) else {
            return Err(TrainingError::InvalidState { from: self.run.state, operation: "train" });
        };

        let sink = ReportSink::from_name(&self.config.training.report_to)
            .unwrap_or(ReportSink::None)
            .observer(&self.layout.metrics_path())?;
        let emitter = Emitter { observer, sink };

        self.run.state = RunState::Running;
        self.run.started_at = Some(Utc::now());
        emitter.emit(&ProgressEvent::Started {
            run_id: self.run.id.clone(),
            total_steps: plan.total_steps,
            examples: plan.examples,
        });
        if self.config.monitoring.log_training_stats {
            tracing::info!(
                trainable_parameters = self.model.trainable_parameters(),
                total_parameters = self.model.total_parameters(),
                examples = plan.examples,
                batch_size = plan.micro_batch,
                grad_accum = plan.grad_accum,
                "starting training"
            );
        }
        self.record_memory(&emitter);

        let result = self.run_steps(&dataset, plan, schedule, &emitter);
        self.dataset = Some(dataset);

        self.run.state = match &result {
            Ok(Outcome::Finished | Outcome::EarlyStopped) => RunState::Completed,
            Ok(Outcome::StopRequested) => RunState::Stopped,
            Err(err) => {
                tracing::error!(run_id = %self.run.id, step = self.run.step, error = %err, "training failed");
                self.run.failure = Some(err.to_string());
                RunState::Failed
            }
        };
        self.run.finished_at = Some(Utc::now());
        self.record_memory(&emitter);

        let summary = self.summary();
        let written = self.write_trainer_state(&summary);
        emitter.emit(&ProgressEvent::Finished {
            run_id: self.run.id.clone(),
            state: self.run.state,
            step: self.run.step,
        });

        result?;
        written?;
        Ok(summary)
    }

    fn run_steps(
        &mut self,
        dataset: &PreparedDataset,
        plan: TrainingPlan,
        schedule: LrSchedule,
        emitter: &Emitter<'_>,
    ) -> TrainingResult<Outcome> {
        let config = Arc::clone(&self.config);
        let training = &config.training;
        let logging_steps = training.logging_steps.max(1);
        let mut early = training.early_stopping_patience.map(|patience| EarlyStopping {
            patience: patience.max(1),
            min_delta: training.early_stopping_min_delta,
            best: f64::INFINITY,
            stale: 0,
        });

        let mut examples = dataset.iter();
        let mut consumed: u64 = 0;

        while self.run.step < plan.total_steps {
            if self.stop.is_stop_requested() {
                tracing::warn!(run_id = %self.run.id, step = self.run.step, "stop requested, ending run");
                return Ok(Outcome::StopRequested);
            }

            let step = self.run.step + 1;
            let learning_rate = schedule.at(step);

            let mut loss_sum = 0.0;
            for _ in 0..plan.grad_accum {
                let mut batch = MicroBatch::default();
                for _ in 0..plan.micro_batch {
                    let example = next_cycled(&mut examples, dataset)?;
                    batch.sequences.push(sequence(&example));
                    consumed += 1;
                }
                loss_sum += self.model.engine_mut().forward_backward(&batch)?;
            }
            self.model.engine_mut().optimizer_step(learning_rate)?;

            let loss = loss_sum / plan.grad_accum as f64;
            self.run.step = step;
            self.run.losses.push(LossPoint { step, loss, learning_rate });
            tracing::debug!(step, loss, learning_rate, "optimizer step");

            if step % logging_steps == 0 || step == plan.total_steps {
                emitter.emit(&ProgressEvent::Step {
                    run_id: self.run.id.clone(),
                    step,
                    total: plan.total_steps,
                    loss,
                    learning_rate,
                    epoch: consumed as f64 / plan.examples as f64,
                });
                if config.monitoring.show_memory_stats {
                    self.record_memory(emitter);
                }
            }

            if training.save_steps > 0 && step % training.save_steps == 0 {
                self.save_checkpoint(step, emitter)?;
            }

            if let Some(early) = early.as_mut() {
                if early.observe(loss) {
                    tracing::info!(step, best_loss = early.best, patience = early.patience, "early stopping");
                    return Ok(Outcome::EarlyStopped);
                }
            }
        }

        Ok(Outcome::Finished)
    }

    fn save_checkpoint(&mut self, step: u64, emitter: &Emitter<'_>) -> TrainingResult<()> {
        let dir = self.layout.checkpoint_dir(step);
        self.model.engine().save_adapter(&dir)?;
        std::fs::write(dir.join("trainer_state.json"), serde_json::to_vec_pretty(&self.summary())?)?;
        self.run.checkpoints.push(dir.clone());
        emitter.emit(&ProgressEvent::Checkpoint { run_id: self.run.id.clone(), step, path: dir });

        if let Some(limit) = self.config.training.save_total_limit {
            let removed = self.layout.rotate_checkpoints(limit)?;
            self.run.checkpoints.retain(|path| !removed.contains(path));
        }
        Ok(())
    }

    fn record_memory(&mut self, emitter: &Emitter<'_>) {
        let snapshot = self.model.report_memory();
        self.run.memory.push((self.run.step, snapshot));
        if self.config.monitoring.show_memory_stats {
            emitter.emit(&ProgressEvent::Memory { run_id: self.run.id.clone(), step: self.run.step, snapshot });
        }
    }

    fn write_trainer_state(&self, summary: &RunSummary) -> TrainingResult<()> {
        self.layout.ensure_dirs()?;
        std::fs::write(self.layout.trainer_state_path(), serde_json::to_vec_pretty(summary)?)?;
        Ok(())
    }

    /// Request a stop. Valid while running; a no-op once the run has ended.
    pub fn stop(&self) -> TrainingResult<()> {
        match self.run.state {
            RunState::Running => {
                self.stop.stop();
                Ok(())
            }
            state if state.is_terminal() => Ok(()),
            state => Err(TrainingError::InvalidState { from: state, operation: "stop" }),
        }
    }

    /// Borrow the run for export. Only completed or stopped runs qualify.
    pub fn exportable(&self) -> TrainingResult<ExportableRun<'_>> {
        match self.run.state {
            RunState::Completed | RunState::Stopped => {
                Ok(ExportableRun { run: &self.run, model: &*self.model, config: &self.config })
            }
            RunState::Failed => Err(TrainingError::ExportFromFailedRun {
                cause: self.run.failure.clone().unwrap_or_else(|| "unknown failure".to_string()),
            }),
            state => Err(TrainingError::InvalidState { from: state, operation: "export" }),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let run = &self.run;
        let runtime_seconds = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        };
        RunSummary {
            run_id: run.id.clone(),
            state: run.state,
            base_model: self.model.name().to_string(),
            dataset_id: self.dataset_id.clone(),
            steps: run.step,
            planned_steps: self.plan.map_or(0, |p| p.total_steps),
            final_loss: run.last_loss(),
            best_loss: run.best_loss(),
            trainable_parameters: self.model.trainable_parameters(),
            total_parameters: self.model.total_parameters(),
            peak_memory: run.memory.iter().map(|(_, m)| *m).max_by_key(|m| m.reserved_bytes),
            started_at: run.started_at,
            finished_at: run.finished_at,
            runtime_seconds,
            checkpoints: run.checkpoints.clone(),
            failure: run.failure.clone(),
            log_history: run.losses.clone(),
        }
    }
}

/// Next example, restarting the dataset at the end of an epoch.
fn next_cycled<'d>(
    examples: &mut crate::dataset::Examples<'d>,
    dataset: &'d PreparedDataset,
) -> TrainingResult<FormattedExample> {
    if let Some(example) = examples.next() {
        return Ok(example?);
    }
    *examples = dataset.iter();
    match examples.next() {
        Some(example) => Ok(example?),
        None => Err(TrainingError::EmptyPlan("dataset has no examples".to_string())),
    }
}

fn sequence(example: &FormattedExample) -> TrainSequence {
    TrainSequence { input_ids: example.input_ids.clone(), labels: example.labels() }
}
