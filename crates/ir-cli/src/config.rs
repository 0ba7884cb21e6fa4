//! TOML config loading for the training CLI.
//!
//! Deserializes `configs/train.toml`, which has `[objective]`, `[model]` and an
//! optional `[training]` section, then merges with CLI overrides.

use std::path::{Path, PathBuf};

use ir_train::model::cross_encoder::CrossEncoderConfig;
use ir_train::model::dual_encoder::DualEncoderConfig;
use ir_train::model::encoder::RepresentationHeadConfig;
use ir_train::training::checkpoint::CheckpointLayout;
use ir_train::training::objective::ObjectiveConfig;
use ir_train::training::trainer::TrainingConfig;
use serde::Deserialize;

/// Top-level structure matching `configs/train.toml`.
#[derive(Debug, Deserialize)]
pub struct TrainToml {
    /// Which objective to run and its loss settings.
    pub objective: ObjectiveConfig,
    /// Model head dimensions.
    pub model: ModelSettings,
    /// Training-loop overrides; unset fields keep the library defaults.
    #[serde(default)]
    pub training: TrainingOverrides,
}

/// Model head settings shared by both model families.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    /// Width of the precomputed token features.
    pub d_model: usize,
    /// Output width of sparse heads (vocabulary size).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Output width of dense heads.
    #[serde(default = "default_dense_dim")]
    pub dense_dim: usize,
    /// Hidden width of the cross-encoder scorer.
    #[serde(default = "default_d_hidden")]
    pub d_hidden: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    /// On-disk layout of dual-encoder checkpoints.
    #[serde(default)]
    pub layout: CheckpointLayout,
}

fn default_vocab_size() -> usize {
    30522
}
fn default_dense_dim() -> usize {
    768
}
fn default_d_hidden() -> usize {
    256
}
fn default_dropout() -> f64 {
    0.1
}

impl ModelSettings {
    /// Dual-encoder config: sparse unless the objective is dense.
    pub fn dual_encoder_config(&self, objective: &ObjectiveConfig) -> DualEncoderConfig {
        let d_output = if objective.dense {
            self.dense_dim
        } else {
            self.vocab_size
        };
        let head = RepresentationHeadConfig::new(self.d_model, d_output)
            .with_sparse(!objective.dense)
            .with_dropout(self.dropout);
        DualEncoderConfig::new(head)
            .with_shared_weights(objective.shared_weights)
            .with_layout(self.layout)
    }

    pub fn cross_encoder_config(&self) -> CrossEncoderConfig {
        CrossEncoderConfig::new(self.d_model)
            .with_d_hidden(self.d_hidden)
            .with_dropout(self.dropout)
    }
}

/// Optional overrides for `TrainingConfig` fields.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TrainingOverrides {
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
    pub max_grad_norm: Option<f64>,
    pub num_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub warmup_steps: Option<usize>,
    pub log_interval: Option<usize>,
    pub checkpoint_interval: Option<usize>,
    pub seed: Option<u64>,
}

/// Flags that take priority over the TOML file.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub output_dir: PathBuf,
    pub tokenizer: Option<PathBuf>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    pub num_epochs: Option<usize>,
}

/// Load and deserialize a `TrainToml` from a TOML file.
pub fn load_train_toml(path: &Path) -> anyhow::Result<TrainToml> {
    let contents = std::fs::read_to_string(path)?;
    let config: TrainToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), kind = %config.objective.kind, "Loaded training config");
    Ok(config)
}

/// Build a `TrainingConfig` from library defaults, TOML overrides and CLI flags.
///
/// Priority chain: `TrainingConfig::new()` defaults < TOML values < CLI flags.
pub fn build_training_config(
    overrides: &TrainingOverrides,
    cli: &CliOverrides,
) -> anyhow::Result<TrainingConfig> {
    let mut config = TrainingConfig::new();

    if let Some(v) = overrides.lr {
        config.lr = v;
    }
    if let Some(v) = overrides.weight_decay {
        config.weight_decay = v;
    }
    if let Some(v) = overrides.max_grad_norm {
        config.max_grad_norm = v;
    }
    if let Some(v) = overrides.num_epochs {
        config.num_epochs = v;
    }
    if let Some(v) = overrides.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = overrides.warmup_steps {
        config.warmup_steps = v;
    }
    if let Some(v) = overrides.log_interval {
        config.log_interval = v;
    }
    if let Some(v) = overrides.checkpoint_interval {
        config.checkpoint_interval = v;
    }
    if let Some(v) = overrides.seed {
        config.seed = v;
    }

    // CLI overrides take highest priority
    if let Some(v) = cli.lr {
        config.lr = v;
    }
    if let Some(v) = cli.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = cli.num_epochs {
        config.num_epochs = v;
    }
    config.output_dir = cli.output_dir.to_string_lossy().into_owned();
    config.tokenizer = cli
        .tokenizer
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());

    if config.batch_size == 0 {
        anyhow::bail!("batch_size must be > 0");
    }
    if config.num_epochs == 0 {
        anyhow::bail!("num_epochs must be > 0");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir_train::training::loss::DistillationMode;
    use ir_train::training::objective::ObjectiveKind;

    #[test]
    fn test_deserialize_full_train_toml() {
        let toml_str = r#"
[objective]
kind = "distil"
n_negatives = 3
lambda_d = 0.001
lambda_q = 0.0005
distillation = "margin_mse"
splade_doc = true
shared_weights = false

[model]
d_model = 64
vocab_size = 1000
dropout = 0.0
layout = "whole"

[training]
lr = 5e-5
batch_size = 16
num_epochs = 3
checkpoint_interval = 100
"#;
        let config: TrainToml = toml::from_str(toml_str).unwrap();
        assert_eq!(config.objective.kind, ObjectiveKind::Distil);
        assert_eq!(config.objective.n_negatives, 3);
        assert_eq!(config.objective.distillation, DistillationMode::MarginMse);
        assert!(config.objective.splade_doc);
        assert!(!config.objective.shared_weights);
        assert_eq!(config.model.d_model, 64);
        assert_eq!(config.model.layout, CheckpointLayout::Whole);
        assert_eq!(config.training.batch_size, Some(16));
        assert_eq!(config.training.checkpoint_interval, Some(100));
        assert!(config.training.warmup_steps.is_none());
    }

    #[test]
    fn test_deserialize_optional_training() {
        let toml_str = r#"
[objective]
kind = "reranker"

[model]
d_model = 32
"#;
        let config: TrainToml = toml::from_str(toml_str).unwrap();
        assert_eq!(config.objective.n_negatives, 7);
        assert_eq!(config.model.vocab_size, 30522);
        assert_eq!(config.model.layout, CheckpointLayout::PerEncoder);
        assert!(config.training.lr.is_none());
    }

    #[test]
    fn test_cli_override_priority() {
        let overrides = TrainingOverrides {
            lr: Some(1e-4),
            batch_size: Some(32),
            seed: Some(7),
            ..Default::default()
        };
        let cli = CliOverrides {
            output_dir: PathBuf::from("runs/a"),
            tokenizer: Some(PathBuf::from("tok/tokenizer.json")),
            batch_size: Some(4),
            ..Default::default()
        };

        let config = build_training_config(&overrides, &cli).unwrap();
        assert!((config.lr - 1e-4).abs() < 1e-12);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.seed, 7);
        assert_eq!(config.num_epochs, 1);
        assert_eq!(config.output_dir, "runs/a");
        assert_eq!(config.tokenizer.as_deref(), Some("tok/tokenizer.json"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let overrides = TrainingOverrides {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(build_training_config(&overrides, &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_model_settings_follow_objective() {
        let settings = ModelSettings {
            d_model: 16,
            vocab_size: 100,
            dense_dim: 24,
            d_hidden: 8,
            dropout: 0.0,
            layout: CheckpointLayout::PerEncoder,
        };

        let mut objective = ObjectiveConfig::new(ObjectiveKind::FirstStage);
        let sparse = settings.dual_encoder_config(&objective);
        assert!(sparse.encoder.sparse);
        assert_eq!(sparse.encoder.d_output, 100);

        objective.dense = true;
        objective.shared_weights = false;
        let dense = settings.dual_encoder_config(&objective);
        assert!(!dense.encoder.sparse);
        assert_eq!(dense.encoder.d_output, 24);
        assert!(!dense.shared_weights);

        assert_eq!(settings.cross_encoder_config().d_hidden, 8);
    }
}
