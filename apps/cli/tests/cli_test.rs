//! Integration tests for the `ferment` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const JOB: &str = r"
model:
  name: org/tiny-llama
  max_seq_length: 128
adapter:
  rank: 4
  target_modules: [q_proj, v_proj]
dataset:
  path: data/train.jsonl
training:
  output_dir: outputs
  batch_size: 2
  grad_accum: 1
  max_steps: 6
  warmup_steps: 1
  save_steps: 3
  learning_rate: 0.01
export:
  method: adapter
";

/// Helper to lay out a project with a small chat dataset and a job file
fn init_project(temp_dir: &TempDir) {
    let data = temp_dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    let rows: Vec<String> = (0..6)
        .map(|i| {
            format!(
                r#"{{"messages":[{{"role":"user","content":"ping {i}"}},{{"role":"assistant","content":"pong {i}"}}]}}"#
            )
        })
        .collect();
    fs::write(data.join("train.jsonl"), rows.join("\n")).unwrap();
    fs::write(temp_dir.path().join("job.yaml"), JOB).unwrap();
}

fn ferment(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ferment").unwrap();
    cmd.current_dir(temp_dir.path()).arg("--config").arg("job.yaml").arg("--log-level").arg("warn");
    cmd
}

#[test]
fn test_missing_config_argument_is_a_usage_error() {
    Command::cargo_bin("ferment").unwrap().assert().code(2);
}

#[test]
fn test_show_config_prints_resolved_paths_and_overrides() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    let expected_dataset = temp_dir.path().join("data/train.jsonl").display().to_string();
    ferment(&temp_dir)
        .arg("--show-config")
        .arg("--override")
        .arg("training.max_steps=10")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_steps: 10"))
        .stdout(predicate::str::contains(expected_dataset));

    assert!(!temp_dir.path().join("outputs").exists());
}

#[test]
fn test_invalid_config_exits_with_config_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir)
        .arg("--override")
        .arg("adapter.rank=0")
        .arg("--override")
        .arg("training.batch_size=0")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("adapter.rank"))
        .stderr(predicate::str::contains("training.batch_size"));
}

#[test]
fn test_unknown_override_key_exits_with_config_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir)
        .arg("--override")
        .arg("training.max_stepz=10")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("training.max_stepz"));
}

#[test]
fn test_unknown_engine_exits_with_config_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir)
        .arg("--override")
        .arg("model.engine=vllm")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("unknown engine `vllm`"));
}

#[test]
fn test_missing_dataset_exits_with_runtime_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir)
        .arg("--override")
        .arg("dataset.path=missing.json")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("missing.json"));
}

#[test]
fn test_full_run_trains_and_exports() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir).assert().success().stdout(predicate::str::contains("Export complete"));

    let outputs = temp_dir.path().join("outputs");
    assert!(outputs.join("trainer_state.json").is_file());
    assert!(outputs.join("checkpoint-3").is_dir());
    assert!(outputs.join("checkpoint-6").is_dir());
    assert!(outputs.join("final/adapter/adapter_config.json").is_file());
    assert!(outputs.join("final/adapter/export_manifest.json").is_file());
}

#[test]
fn test_json_report() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    let output = ferment(&temp_dir).arg("--json").output().unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["run"]["state"], "completed");
    assert_eq!(report["run"]["steps"], 6);
    assert_eq!(report["export"]["artifacts"][0]["method"], "adapter");
    assert_eq!(report["export"]["failures"].as_array().map(Vec::len), Some(0));
}

#[test]
fn test_json_report_lists_skipped_records() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);
    let dataset = temp_dir.path().join("data/train.jsonl");
    let mut rows = fs::read_to_string(&dataset).unwrap();
    rows.push_str("\n{\"title\": \"no conversation here\"}");
    fs::write(&dataset, rows).unwrap();

    let output = ferment(&temp_dir).arg("--json").output().unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["dataset"]["total"], 7);
    assert_eq!(report["dataset"]["kept"], 6);
    assert_eq!(report["dataset"]["skipped"][0]["record"], 6);
    assert!(report["dataset"]["skipped"][0]["reason"].as_str().unwrap().contains("instruction/response"));
}

#[test]
fn test_no_save_skips_export() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir).arg("--no-save").assert().success();

    assert!(temp_dir.path().join("outputs/trainer_state.json").is_file());
    assert!(!temp_dir.path().join("outputs/final").exists());
}

#[test]
fn test_partial_export_has_distinct_exit_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);
    fs::write(temp_dir.path().join("occupied"), "not a directory").unwrap();

    ferment(&temp_dir)
        .arg("--override")
        .arg("export.method=adapter,merged_fp")
        .arg("--override")
        .arg("export.paths.merged_fp=occupied")
        .assert()
        .code(5)
        .stdout(predicate::str::contains("Export partially failed"));

    assert!(temp_dir.path().join("outputs/final/adapter/adapter_model.json").is_file());
}

#[test]
fn test_total_export_failure_exit_code() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);
    fs::write(temp_dir.path().join("occupied"), "not a directory").unwrap();

    ferment(&temp_dir)
        .arg("--override")
        .arg("export.paths.adapter=occupied")
        .assert()
        .code(6);
}

#[test]
fn test_publish_failure_keeps_local_artifacts() {
    let temp_dir = TempDir::new().unwrap();
    init_project(&temp_dir);

    ferment(&temp_dir)
        .env_remove("HF_TOKEN")
        .arg("--override")
        .arg("export.remote_push=true")
        .arg("--override")
        .arg("export.remote_id=org/tiny-adapter")
        .arg("--override")
        .arg("export.remote_endpoint=http://127.0.0.1:9")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("authentication failed"));

    assert!(temp_dir.path().join("outputs/final/adapter/adapter_model.json").is_file());
}
