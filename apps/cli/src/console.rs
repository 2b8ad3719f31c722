//! Terminal rendering of run progress and the final report.

use colored::Colorize;
use ferment_training::{
    DatasetReport, ExportOutcome, ExportReport, ProgressEvent, ProgressObserver, PublishedArtifact, RunState,
    RunSummary,
};
use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}";

/// Progress bar fed by training events. Hidden under `--json`.
pub struct Console {
    bar: ProgressBar,
    show_memory: bool,
}

impl Console {
    pub fn new(hidden: bool, show_memory: bool) -> Self {
        let bar = if hidden { ProgressBar::hidden() } else { ProgressBar::new(0) };
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar, show_memory }
    }
}

impl ProgressObserver for Console {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { total_steps, examples, .. } => {
                self.bar.set_length(*total_steps);
                self.bar.set_position(0);
                self.bar.set_message(format!("{examples} examples"));
            }
            ProgressEvent::Step { step, loss, learning_rate, .. } => {
                self.bar.set_position(*step);
                self.bar.set_message(format!("loss {loss:.4}  lr {learning_rate:.2e}"));
            }
            ProgressEvent::Checkpoint { step, path, .. } => {
                self.bar.println(format!("{} checkpoint {step} -> {}", "✓".green(), path.display().to_string().dimmed()));
            }
            ProgressEvent::Memory { step, snapshot, .. } if self.show_memory => {
                self.bar.println(
                    format!(
                        "  memory @ step {step}: {:.3} GiB resident, {:.3} GiB reserved",
                        snapshot.resident_gib(),
                        snapshot.reserved_gib()
                    )
                    .dimmed()
                    .to_string(),
                );
            }
            ProgressEvent::Memory { .. } => {}
            ProgressEvent::Message { message, .. } => self.bar.println(message),
            ProgressEvent::Finished { state, step, .. } => {
                self.bar.finish_with_message(format!("{} at step {step}", paint_state(*state)));
            }
        }
    }
}

fn paint_state(state: RunState) -> String {
    match state {
        RunState::Completed => state.as_str().green().to_string(),
        RunState::Stopped => state.as_str().yellow().to_string(),
        RunState::Failed => state.as_str().red().to_string(),
        _ => state.as_str().to_string(),
    }
}

pub fn print_dataset(report: &DatasetReport) {
    println!(
        "  Dataset: {} ({} of {} records kept)",
        report.source.display().to_string().cyan(),
        report.kept.to_string().green(),
        report.total
    );
    if !report.skipped.is_empty() {
        println!("  {}", format!("{} record(s) skipped, see log for details", report.skipped.len()).yellow());
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Training finished".bold().cyan());
    println!("  Run: {}", summary.run_id.to_string().cyan());
    println!("  State: {}", paint_state(summary.state));
    println!("  Steps: {}/{}", summary.steps, summary.planned_steps);
    if let Some(loss) = summary.final_loss {
        println!("  Final loss: {loss:.4}");
    }
    println!(
        "  Trainable parameters: {} of {}",
        summary.trainable_parameters.to_string().green(),
        summary.total_parameters
    );
    if let Some(seconds) = summary.runtime_seconds {
        println!("  Runtime: {seconds:.1}s");
    }
}

pub fn print_export(report: &ExportReport) {
    println!();
    let title = match report.outcome() {
        ExportOutcome::Complete => "Export complete".bold().green(),
        ExportOutcome::Partial => "Export partially failed".bold().yellow(),
        ExportOutcome::Failed => "Export failed".bold().red(),
    };
    println!("{title}");
    for artifact in &report.artifacts {
        println!(
            "  {} {:<14} {} ({} files, {} bytes)",
            "✓".green(),
            artifact.method.as_str(),
            artifact.dir.display().to_string().dimmed(),
            artifact.files.len(),
            artifact.total_bytes()
        );
    }
    for failure in &report.failures {
        println!("  {} {:<14} {}", "✗".red(), failure.method.as_str(), failure.message.red());
    }
}

pub fn print_published(published: &[PublishedArtifact]) {
    for artifact in published {
        println!("  {} published {} ({} files)", "↑".cyan(), artifact.location, artifact.files);
    }
}
