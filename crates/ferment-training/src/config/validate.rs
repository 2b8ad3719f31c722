use super::{DType, JobConfig};
use crate::dataset::Split;
use crate::export::ExportMethod;
use crate::error::{ConfigError, ConfigResult, Violation};
use crate::progress::ReportSink;
use crate::template::ChatTemplate;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Check a resolved config, reporting every problem at once.
pub fn validate(config: &JobConfig) -> ConfigResult<()> {
    let violations = violations(config);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(violations))
    }
}

/// Pure validation: the list of everything wrong with `config`.
pub fn violations(config: &JobConfig) -> Vec<Violation> {
    let mut out = Vec::new();
    check_model(config, &mut out);
    check_adapter(config, &mut out);
    check_template(config, &mut out);
    check_dataset(config, &mut out);
    check_training(config, &mut out);
    check_export(config, &mut out);
    out
}

fn require_absolute(field: &str, path: &Path, out: &mut Vec<Violation>) {
    if path.as_os_str().is_empty() {
        out.push(Violation::new(field, "is required"));
    } else if !path.is_absolute() {
        out.push(Violation::new(field, "must be an absolute path (resolve paths first)"));
    }
}

fn check_model(config: &JobConfig, out: &mut Vec<Violation>) {
    let model = &config.model;
    if model.name.trim().is_empty() {
        out.push(Violation::new("model.name", "is required"));
    }
    if model.max_seq_length == 0 {
        out.push(Violation::new("model.max_seq_length", "must be >= 1"));
    }
    if model.quantization.is_low_bit() && model.dtype == DType::F32 {
        out.push(Violation::new("model.dtype", "low-bit quantization requires f16, bf16 or auto compute dtype"));
    }
    if model.engine.trim().is_empty() {
        out.push(Violation::new("model.engine", "is required"));
    }
}

fn check_adapter(config: &JobConfig, out: &mut Vec<Violation>) {
    let adapter = &config.adapter;
    if adapter.rank == 0 {
        out.push(Violation::new("adapter.rank", "must be >= 1"));
    }
    if !adapter.alpha.is_finite() || adapter.alpha <= 0.0 {
        out.push(Violation::new("adapter.alpha", "must be > 0"));
    }
    if !(0.0..1.0).contains(&adapter.dropout) {
        out.push(Violation::new("adapter.dropout", "must be in [0, 1)"));
    }
    if adapter.target_modules.is_empty() {
        out.push(Violation::new("adapter.target_modules", "must name at least one module"));
    }
    let mut seen = BTreeSet::new();
    for name in &adapter.target_modules {
        if name.trim().is_empty() {
            out.push(Violation::new("adapter.target_modules", "contains an empty name"));
        } else if !seen.insert(name.as_str()) {
            out.push(Violation::new("adapter.target_modules", format!("`{name}` is listed twice")));
        }
    }
}

fn check_template(config: &JobConfig, out: &mut Vec<Violation>) {
    if ChatTemplate::from_name(&config.template.name).is_none() {
        out.push(Violation::new(
            "template.name",
            format!("unknown template `{}` (known: {})", config.template.name, ChatTemplate::NAMES.join(", ")),
        ));
    }
}

fn check_dataset(config: &JobConfig, out: &mut Vec<Violation>) {
    let dataset = &config.dataset;
    require_absolute("dataset.path", &dataset.path, out);
    if let Err(message) = Split::parse(&dataset.split) {
        out.push(Violation::new("dataset.split", message));
    }
    if dataset.text_field.trim().is_empty() {
        out.push(Violation::new("dataset.text_field", "is required"));
    }
    if dataset.message_field.trim().is_empty() {
        out.push(Violation::new("dataset.message_field", "is required"));
    }
    if dataset.batch_size == 0 {
        out.push(Violation::new("dataset.batch_size", "must be >= 1"));
    }
}

fn check_training(config: &JobConfig, out: &mut Vec<Violation>) {
    let training = &config.training;
    require_absolute("training.output_dir", &training.output_dir, out);
    if training.batch_size == 0 {
        out.push(Violation::new("training.batch_size", "must be >= 1"));
    }
    if training.grad_accum == 0 {
        out.push(Violation::new("training.grad_accum", "must be >= 1"));
    }
    match training.num_epochs {
        Some(0) => out.push(Violation::new("training.num_epochs", "must be >= 1")),
        Some(_) => {}
        None if training.max_steps == 0 => {
            out.push(Violation::new("training.max_steps", "must be >= 1 when num_epochs is not set"));
        }
        None => {}
    }
    if !training.learning_rate.is_finite() || training.learning_rate <= 0.0 {
        out.push(Violation::new("training.learning_rate", "must be > 0"));
    }
    if training.num_epochs.is_none() && training.warmup_steps > training.max_steps {
        out.push(Violation::new("training.warmup_steps", "must not exceed max_steps"));
    }
    if !training.weight_decay.is_finite() || training.weight_decay < 0.0 {
        out.push(Violation::new("training.weight_decay", "must be >= 0"));
    }
    if training.logging_steps == 0 {
        out.push(Violation::new("training.logging_steps", "must be >= 1"));
    }
    if training.save_total_limit == Some(0) {
        out.push(Violation::new("training.save_total_limit", "must be >= 1 when set"));
    }
    if training.early_stopping_patience == Some(0) {
        out.push(Violation::new("training.early_stopping_patience", "must be >= 1 when set"));
    }
    if ReportSink::from_name(&training.report_to).is_none() {
        out.push(Violation::new(
            "training.report_to",
            format!("unknown sink `{}` (known: {})", training.report_to, ReportSink::NAMES.join(", ")),
        ));
    }
}

fn check_export(config: &JobConfig, out: &mut Vec<Violation>) {
    let export = &config.export;
    if export.method.is_empty() {
        out.push(Violation::new("export.method", "must name at least one format"));
    }
    let mut seen = BTreeSet::new();
    for method in &export.method {
        if !seen.insert(*method) {
            out.push(Violation::new("export.method", format!("`{method}` is listed twice")));
        }
    }
    if let Some(path) = &export.save_path {
        require_absolute("export.save_path", path, out);
    }
    for (method, path) in &export.paths {
        require_absolute(&format!("export.paths.{method}"), path, out);
    }
    check_destinations(config, out);
    if export.interchange_quantization.trim().is_empty() {
        out.push(Violation::new("export.interchange_quantization", "is required"));
    }
    if export.remote_push {
        if export.remote_id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            out.push(Violation::new("export.remote_id", "is required when remote_push is enabled"));
        }
        if export.remote_endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
            out.push(Violation::new("export.remote_endpoint", "is required when remote_push is enabled"));
        }
    }
}

/// Each export must own its directory: no sharing, no nesting, and no overlap with
/// the run's own output directory.
fn check_destinations(config: &JobConfig, out: &mut Vec<Violation>) {
    let export = &config.export;
    let output_dir = &config.training.output_dir;
    if !output_dir.is_absolute() {
        return;
    }
    let field = |method: ExportMethod| {
        if export.paths.contains_key(&method) {
            format!("export.paths.{method}")
        } else {
            "export.save_path".to_string()
        }
    };

    let mut unique = BTreeSet::new();
    let destinations: Vec<(ExportMethod, PathBuf)> = export
        .method
        .iter()
        .filter(|m| unique.insert(**m))
        .map(|m| (*m, export.destination(*m, output_dir)))
        .collect();

    for (i, (method, dir)) in destinations.iter().enumerate() {
        if output_dir.starts_with(dir) {
            out.push(Violation::new(
                field(*method),
                format!("`{method}` export directory {} overlaps training.output_dir", dir.display()),
            ));
        }
        for (other, other_dir) in &destinations[..i] {
            if dir.starts_with(other_dir) || other_dir.starts_with(dir) {
                out.push(Violation::new(
                    field(*method),
                    format!("`{method}` and `{other}` export into overlapping directories ({})", dir.display()),
                ));
            }
        }
    }
}
