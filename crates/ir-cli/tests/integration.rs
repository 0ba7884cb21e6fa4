//! Integration tests for the ir-train CLI.
//!
//! Each test drives the built binary against a temporary config and a small
//! synthetic query-group file.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use ir_train::training::checkpoint::{weights_file, QUERY_SUBDIR, TOKENIZER_NAME};
use ir_train::training::data::{write_groups, QueryGroup};
use ir_train::training::trainer::{checkpoint_dir, TrainState};

const DIM: usize = 4;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

fn write_data(dir: &Path, n: usize, with_scores: bool) -> PathBuf {
    let groups: Vec<QueryGroup> = (0..n)
        .map(|g| QueryGroup {
            query: vec![vec![0.1 * (g + 1) as f32; DIM]; 2],
            candidates: (0..3)
                .map(|c| vec![vec![0.5 - 0.3 * c as f32 + 0.05 * g as f32; DIM]; c + 1])
                .collect(),
            scores: with_scores.then(|| vec![5.0, 1.0, 0.5]),
        })
        .collect();
    let path = dir.join("train.jsonl");
    write_groups(&path, &groups).unwrap();
    path
}

fn write_config(dir: &Path, objective: &str) -> PathBuf {
    let path = dir.join("train.toml");
    let contents = format!(
        r#"
[objective]
{objective}
n_negatives = 2

[model]
d_model = {DIM}
vocab_size = 12
dense_dim = 6
d_hidden = 8
dropout = 0.0

[training]
lr = 1e-3
batch_size = 2
num_epochs = 2
log_interval = 1
checkpoint_interval = 2
"#
    );
    std::fs::write(&path, contents).unwrap();
    path
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ir-train"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn train(config: &Path, data: &Path, output: &Path, extra: &[&str]) -> Output {
    let mut args = vec![
        "train",
        "--config",
        config.to_str().unwrap(),
        "--data",
        data.to_str().unwrap(),
        "--output-dir",
        output.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    run_cli(&args)
}

/// Verify that configs/train.toml parses and names a known objective.
#[test]
fn test_real_train_toml_is_valid() {
    let toml_path = workspace_root().join("configs").join("train.toml");
    assert!(toml_path.exists(), "configs/train.toml not found");

    let contents = std::fs::read_to_string(&toml_path).unwrap();
    let value: toml::Value = toml::from_str(&contents).unwrap();
    let kind = value["objective"]["kind"].as_str().unwrap();
    assert!(["reranker", "reranker_distil", "distil", "first_stage"].contains(&kind));
}

#[test]
fn test_cli_trains_sparse_dual_encoder() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = write_data(tmp.path(), 4, true);
    let config = write_config(tmp.path(), "kind = \"distil\"\nshared_weights = false");
    let tokenizer = tmp.path().join("tok.json");
    std::fs::write(&tokenizer, "{\"model\": {}}").unwrap();
    let output = tmp.path().join("out");

    let result = train(
        &config,
        &data,
        &output,
        &["--tokenizer", tokenizer.to_str().unwrap()],
    );
    assert!(
        result.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("Objective: distil"), "{stdout}");

    // 4 groups / batch 2 = 2 steps per epoch, 2 epochs.
    let state = TrainState::load(&output).unwrap();
    assert_eq!(state.global_step, 4);
    assert_eq!(state.log_history.len(), 4);
    let last = state.log_history.last().unwrap();
    for key in ["loss", "ce_loss", "distil_loss", "flops_loss", "anti-zero", "L0_d", "L0_q"] {
        assert!(last.get(key).is_some(), "missing {key} in {last:?}");
    }

    for dir in [checkpoint_dir(&output, 2), checkpoint_dir(&output, 4), output.clone()] {
        assert!(weights_file(&dir).exists(), "{}", dir.display());
        assert!(weights_file(&dir.join(QUERY_SUBDIR)).exists());
        assert!(dir.join(TOKENIZER_NAME).exists());
    }
    assert!(output.join("model_config.json").exists());
    assert!(output.join("training_config.json").exists());
}

#[test]
fn test_cli_trains_dense_first_stage_without_sparsity_logs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = write_data(tmp.path(), 3, false);
    let config = write_config(tmp.path(), "kind = \"first_stage\"\ndense = true");
    let output = tmp.path().join("out");

    let result = train(&config, &data, &output, &["--num-epochs", "1"]);
    assert!(
        result.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&result.stderr)
    );

    let state = TrainState::load(&output).unwrap();
    assert_eq!(state.global_step, 2);
    let last = state.log_history.last().unwrap();
    assert!(last.get("ce_loss").is_some());
    assert!(last.get("L0_d").is_none());
    assert!(last.get("distil_loss").is_none());
    // Shared weights: no separate query encoder on disk.
    assert!(!weights_file(&output.join(QUERY_SUBDIR)).exists());
}

#[test]
fn test_cli_reranker_resume() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = write_data(tmp.path(), 4, true);
    let config = write_config(tmp.path(), "kind = \"reranker_distil\"\ndistillation = \"margin_mse\"");
    let first = tmp.path().join("first");

    let result = train(&config, &data, &first, &["--num-epochs", "1"]);
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));

    let resume = checkpoint_dir(&first, 2);
    let second = tmp.path().join("second");
    let result = train(
        &config,
        &data,
        &second,
        &["--resume-from", resume.to_str().unwrap()],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));

    let state = TrainState::load(&second).unwrap();
    assert_eq!(state.global_step, 4);
    let steps: Vec<usize> = state.log_history.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4]);
}

#[test]
fn test_cli_rejects_missing_teacher_scores() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = write_data(tmp.path(), 2, false);
    let config = write_config(tmp.path(), "kind = \"reranker_distil\"");
    let output = tmp.path().join("out");

    let result = train(&config, &data, &output, &[]);
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("teacher scores"), "{stderr}");
}

#[test]
fn test_cli_rejects_feature_width_mismatch() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = write_data(tmp.path(), 2, true);
    let config = tmp.path().join("wide.toml");
    std::fs::write(
        &config,
        "[objective]\nkind = \"reranker\"\nn_negatives = 2\n\n[model]\nd_model = 16\n",
    )
    .unwrap();

    let result = train(&config, &data, &tmp.path().join("out"), &[]);
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("d_model"), "{stderr}");
}
