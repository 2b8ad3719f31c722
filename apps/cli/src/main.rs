//! Ferment CLI - run a LoRA fine-tuning job from a single configuration file.
//!
//! Exit codes:
//! - `0` success
//! - `2` command-line usage error
//! - `3` configuration error
//! - `4` runtime failure (model, dataset, training)
//! - `5` some export methods failed
//! - `6` every export method failed
//! - `7` publishing failed after a successful export

mod console;
mod job;

use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Ferment - LoRA fine-tuning orchestration
///
/// Loads a base model, attaches a low-rank adapter, trains it on a chat dataset
/// and exports the result in one or more formats.
#[derive(Parser, Debug)]
#[command(name = "ferment", author, version, about = "Ferment - LoRA fine-tuning from one config file")]
struct Args {
    /// Job configuration (YAML, or TOML when the file ends in `.toml`)
    #[arg(short, long)]
    config: PathBuf,

    /// Override a single field, e.g. `training.max_steps=10` (repeatable)
    #[arg(short = 'o', long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Print the resolved configuration as YAML and exit
    #[arg(long)]
    show_config: bool,

    /// Train without exporting
    #[arg(long)]
    no_save: bool,

    /// Root for relative paths in the configuration (defaults to the current directory)
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the run and export report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so `--json` and `--show-config` output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let project_root = match args.project_root {
        Some(root) => root,
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(e) => {
                eprintln!("{} cannot read current directory: {e}", "error:".red().bold());
                return ExitCode::from(job::EXIT_RUNTIME);
            }
        },
    };

    let options = job::Options {
        config: args.config,
        overrides: args.overrides,
        show_config: args.show_config,
        no_save: args.no_save,
        project_root,
        json: args.json,
    };

    match job::execute(options).await {
        Ok(report) => ExitCode::from(report.exit_code()),
        Err(err) => {
            let violations = err.violations();
            if violations.is_empty() {
                eprintln!("{} {err}", "error:".red().bold());
            } else {
                eprintln!("{} invalid configuration ({} problem(s))", "error:".red().bold(), violations.len());
                for violation in violations {
                    eprintln!("  {} {violation}", "-".red());
                }
            }
            ExitCode::from(err.exit_code())
        }
    }
}
