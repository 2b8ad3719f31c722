use crate::engine::MemorySnapshot;
use crate::error::TrainingResult;
use crate::orchestrator::{RunId, RunState};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId, total_steps: u64, examples: usize },
    Step { run_id: RunId, step: u64, total: u64, loss: f64, learning_rate: f64, epoch: f64 },
    Checkpoint { run_id: RunId, step: u64, path: PathBuf },
    Memory { run_id: RunId, step: u64, snapshot: MemorySnapshot },
    Message { run_id: RunId, message: String },
    Finished { run_id: RunId, state: RunState, step: u64 },
}

impl ProgressEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Started { run_id, .. }
            | Self::Step { run_id, .. }
            | Self::Checkpoint { run_id, .. }
            | Self::Memory { run_id, .. }
            | Self::Message { run_id, .. }
            | Self::Finished { run_id, .. } => run_id,
        }
    }
}

/// Receives run events. Called synchronously from the training loop, so
/// implementations should not block for long.
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Forwards every event to each inner observer in order.
#[derive(Default)]
pub struct Observers(Vec<Box<dyn ProgressObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, observer: Box<dyn ProgressObserver>) -> Self {
        self.0.push(observer);
        self
    }

    pub fn push(&mut self, observer: Box<dyn ProgressObserver>) {
        self.0.push(observer);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ProgressObserver for Observers {
    fn on_event(&self, event: &ProgressEvent) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id, total_steps, examples } => {
                tracing::info!(%run_id, total_steps, examples, "training started");
            }
            ProgressEvent::Step { run_id, step, total, loss, learning_rate, epoch } => {
                tracing::info!(%run_id, step, total, loss = format!("{loss:.4}"), learning_rate, epoch = format!("{epoch:.2}"), "step");
            }
            ProgressEvent::Checkpoint { run_id, step, path } => {
                tracing::info!(%run_id, step, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::Memory { run_id, step, snapshot } => {
                tracing::info!(
                    %run_id,
                    step,
                    resident_gib = format!("{:.3}", snapshot.resident_gib()),
                    reserved_gib = format!("{:.3}", snapshot.reserved_gib()),
                    "memory"
                );
            }
            ProgressEvent::Message { run_id, message } => tracing::info!(%run_id, "{message}"),
            ProgressEvent::Finished { run_id, state, step } => {
                tracing::info!(%run_id, %state, step, "training finished");
            }
        }
    }
}

/// Appends step metrics as JSON lines.
pub struct JsonlObserver {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlObserver {
    pub fn create(path: &Path) -> TrainingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self { path: path.to_path_buf(), writer: Mutex::new(BufWriter::new(file)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressObserver for JsonlObserver {
    fn on_event(&self, event: &ProgressEvent) {
        if !matches!(event, ProgressEvent::Step { .. } | ProgressEvent::Finished { .. }) {
            return;
        }
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = written {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to write metrics");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingObserver {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Step numbers of every `Step` event, in emission order.
    pub fn steps(&self) -> Vec<u64> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Step { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }
}

impl ProgressObserver for CollectingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Where `training.report_to` sends step metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSink {
    None,
    Log,
    Jsonl,
}

impl ReportSink {
    pub const NAMES: &'static [&'static str] = &["none", "log", "jsonl"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "log" | "tracing" => Some(Self::Log),
            "jsonl" => Some(Self::Jsonl),
            _ => None,
        }
    }

    /// Build the observer for this sink. `metrics_path` is used by `jsonl` only.
    pub fn observer(self, metrics_path: &Path) -> TrainingResult<Option<Box<dyn ProgressObserver>>> {
        Ok(match self {
            Self::None => None,
            Self::Log => Some(Box::new(TracingObserver)),
            Self::Jsonl => Some(Box::new(JsonlObserver::create(metrics_path)?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn step(run_id: &RunId, step: u64) -> ProgressEvent {
        ProgressEvent::Step { run_id: run_id.clone(), step, total: 3, loss: 1.5, learning_rate: 1e-4, epoch: 0.5 }
    }

    #[test]
    fn test_report_sink_names() {
        for name in ReportSink::NAMES {
            assert!(ReportSink::from_name(name).is_some());
        }
        assert_eq!(ReportSink::from_name("JSONL"), Some(ReportSink::Jsonl));
        assert_eq!(ReportSink::from_name("wandb"), None);
    }

    #[test]
    fn test_jsonl_observer_writes_step_lines_only() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metrics.jsonl");
        let run_id = RunId::new();
        let observer = JsonlObserver::create(&path).unwrap();

        observer.on_event(&ProgressEvent::Message { run_id: run_id.clone(), message: "hi".to_string() });
        observer.on_event(&step(&run_id, 1));
        observer.on_event(&step(&run_id, 2));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["type"], "step");
        assert_eq!(lines[1]["step"], 2);
    }

    #[test]
    fn test_observers_fan_out() {
        let run_id = RunId::new();
        let observers = Observers::new().with(Box::new(TracingObserver)).with(Box::new(CollectingObserver::default()));
        assert_eq!(observers.len(), 2);
        observers.on_event(&step(&run_id, 1));

        let collecting = CollectingObserver::default();
        collecting.on_event(&step(&run_id, 4));
        assert_eq!(collecting.steps(), vec![4]);
        assert_eq!(collecting.events()[0].run_id(), &run_id);
    }
}
