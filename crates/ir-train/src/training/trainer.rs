//! Training-loop driver shared by every objective.
//!
//! The driver owns batching, the AdamW optimizer with a warmup + cosine LR
//! schedule, periodic log flushes and checkpointing. Everything
//! objective-specific lives behind [`Objective`].

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::model::bridge::tensor_to_f64;
use crate::training::checkpoint::{load_checkpoint, save_checkpoint, CheckpointModel};
use crate::training::data::{Collate, GroupDataset};
use crate::training::metrics::{LogRecord, MetricAccumulator};
use crate::training::objective::{Objective, StepOutput};

/// Optimizer record name inside a checkpoint directory (burn appends `.mpk`).
pub const OPTIMIZER_NAME: &str = "optimizer";
/// Trainer state file inside a checkpoint directory.
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";

/// Progress of a training run, persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    /// Optimizer steps taken so far.
    pub global_step: usize,
    /// Fractional epoch, `global_step / batches_per_epoch`.
    pub epoch: f64,
    #[serde(default)]
    pub log_history: Vec<LogRecord>,
}

impl TrainState {
    pub fn new(global_step: usize, epoch: f64) -> Self {
        Self {
            global_step,
            epoch,
            log_history: Vec::new(),
        }
    }

    pub fn save(&self, dir: &Path) -> crate::Result<()> {
        let file = std::fs::File::create(dir.join(TRAINER_STATE_NAME))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> crate::Result<Self> {
        let file = std::fs::File::open(dir.join(TRAINER_STATE_NAME))?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Hyperparameters of the training loop.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Peak learning rate for AdamW.
    #[config(default = 2e-5)]
    pub lr: f64,
    #[config(default = 0.01)]
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping.
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
    #[config(default = 1)]
    pub num_epochs: usize,
    /// Query groups per step.
    #[config(default = 8)]
    pub batch_size: usize,
    /// Number of linear warmup steps.
    #[config(default = 0)]
    pub warmup_steps: usize,
    /// Steps between log flushes. 0 disables periodic logging.
    #[config(default = 10)]
    pub log_interval: usize,
    /// Steps between checkpoints. 0 disables intermediate checkpoints.
    #[config(default = 0)]
    pub checkpoint_interval: usize,
    /// Directory for checkpoints and the final model.
    #[config(default = "String::from(\"output\")")]
    pub output_dir: String,
    /// Seed for batch shuffling.
    #[config(default = 42)]
    pub seed: u64,
    /// Tokenizer artifact copied into every checkpoint.
    pub tokenizer: Option<String>,
}

impl TrainingConfig {
    pub fn total_steps(&self, dataset: &GroupDataset) -> usize {
        dataset.num_batches(self.batch_size) * self.num_epochs
    }

    fn tokenizer_path(&self) -> Option<&Path> {
        self.tokenizer.as_deref().map(Path::new)
    }
}

/// Compute the learning rate at a given step using warmup + cosine decay.
///
/// - Warmup phase (`step < warmup_steps`): linearly ramps from 0 to `base_lr`.
/// - Cosine phase: decays from `base_lr` to 0 following a cosine schedule.
pub fn lr_schedule(base_lr: f64, warmup_steps: usize, total_steps: usize, step: usize) -> f64 {
    if warmup_steps > 0 && step < warmup_steps {
        base_lr * (step + 1) as f64 / warmup_steps as f64
    } else {
        let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
        let progress = (step.saturating_sub(warmup_steps)) as f64 / decay_steps as f64;
        let progress = progress.min(1.0);
        base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Directory of the intermediate checkpoint written at `step`.
pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-{step}"))
}

/// Emit one log record: mean loss since the last flush, learning rate, and
/// whatever the objective reports.
fn flush_logs<B, M, O>(
    objective: &mut O,
    state: &mut TrainState,
    loss: &mut MetricAccumulator,
    lr: f64,
) where
    B: Backend,
    O: Objective<B, M>,
{
    let mut record = LogRecord::new(state.global_step);
    if let Some(mean) = loss.drain_and_reset() {
        record.insert("loss", mean);
    }
    record.insert("learning_rate", lr);
    objective.log(state, &mut record);

    let warnings = record.health_check();
    if !warnings.is_empty() {
        tracing::warn!(step = record.step, "Health check warnings: {:?}", warnings);
    }
    tracing::info!(step = record.step, "{}", record.display());
    state.log_history.push(record);
}

/// Save model weights, optimizer record and trainer state into `dir`.
fn save_training_checkpoint<B, M, Opt>(
    model: &M,
    optimizer: &Opt,
    state: &TrainState,
    dir: &Path,
    tokenizer: Option<&Path>,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + CheckpointModel<B>,
    Opt: Optimizer<M, B>,
{
    save_checkpoint::<B, M>(model, dir, tokenizer)?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    Recorder::<B>::record(&recorder, optimizer.to_record(), dir.join(OPTIMIZER_NAME))
        .map_err(|e| anyhow::anyhow!("Failed to save optimizer to {}: {e}", dir.display()))?;
    state.save(dir)?;

    tracing::info!(
        step = state.global_step,
        dir = %dir.display(),
        "Checkpoint saved (model + optimizer + state)"
    );
    Ok(())
}

/// Run the training loop.
///
/// Each step collates one batch of query groups, asks `objective` for the
/// loss, and applies one AdamW update. With `resume_from`, model weights,
/// optimizer state and trainer state are restored from that checkpoint
/// directory and the already-completed steps of the seeded batch order are
/// skipped.
///
/// Returns the trained model and the final [`TrainState`].
pub fn train<B, M, O>(
    config: &TrainingConfig,
    mut model: M,
    objective: &mut O,
    dataset: &GroupDataset,
    device: &B::Device,
    resume_from: Option<&Path>,
) -> anyhow::Result<(M, TrainState)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + CheckpointModel<B>,
    O: Objective<B, M>,
    O::Batch: Collate<B>,
{
    if dataset.is_empty() {
        anyhow::bail!("training dataset is empty");
    }
    let output_dir = PathBuf::from(&config.output_dir);
    std::fs::create_dir_all(&output_dir)?;

    let batches_per_epoch = dataset.num_batches(config.batch_size);
    let total_steps = config.total_steps(dataset);

    let optim_config = AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(
            config.max_grad_norm as f32,
        )));
    let mut optimizer = optim_config.init();

    let mut state = TrainState::default();
    if let Some(dir) = resume_from {
        model = load_checkpoint(model, dir, device)?;

        let optim_path = dir.join(OPTIMIZER_NAME);
        if optim_path.with_extension("mpk").exists() {
            let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
            let record = Recorder::<B>::load(&recorder, optim_path, device).map_err(|e| {
                anyhow::anyhow!("Failed to load optimizer from {}: {e}", dir.display())
            })?;
            optimizer = optimizer.load_record(record);
        } else {
            tracing::warn!(dir = %dir.display(), "No optimizer state in checkpoint; starting fresh");
        }

        state = TrainState::load(dir)?;
        tracing::info!(
            step = state.global_step,
            epoch = state.epoch,
            "Resumed training from checkpoint"
        );
    }
    let start_step = state.global_step;

    tracing::info!(
        objective = objective.name(),
        groups = dataset.len(),
        n_negatives = dataset.n_negatives(),
        batch_size = config.batch_size,
        epochs = config.num_epochs,
        total_steps,
        start_step,
        "Starting training"
    );

    let pb = ProgressBar::new(total_steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_position(start_step as u64);

    let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
    let mut loss_acc = MetricAccumulator::new();
    let mut lr = lr_schedule(config.lr, config.warmup_steps, total_steps, start_step);
    let mut step = 0;
    let train_start = Instant::now();

    for epoch in 0..config.num_epochs {
        // Drawn even for skipped epochs so a resumed run sees the same order.
        let batches = dataset.epoch_batches(config.batch_size, &mut rng);
        for indices in batches {
            if step < start_step {
                step += 1;
                continue;
            }

            lr = lr_schedule(config.lr, config.warmup_steps, total_steps, step);
            let groups = dataset.select(&indices);
            let batch = <O::Batch as Collate<B>>::collate(&groups, device)?;

            let StepOutput { loss, .. } = objective.compute_loss(&model, batch, false)?;
            let loss_value = tensor_to_f64(loss.clone().detach());

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr, model, grads);

            step += 1;
            state.global_step = step;
            state.epoch = step as f64 / batches_per_epoch as f64;
            loss_acc.record(loss_value);
            tracing::debug!(step, epoch, loss = loss_value, lr, "Step complete");
            pb.inc(1);
            pb.set_message(format!("loss={loss_value:.4}"));

            if config.log_interval > 0 && step % config.log_interval == 0 {
                flush_logs::<B, M, O>(objective, &mut state, &mut loss_acc, lr);
            }

            if config.checkpoint_interval > 0 && step % config.checkpoint_interval == 0 {
                save_training_checkpoint::<B, M, _>(
                    &model,
                    &optimizer,
                    &state,
                    &checkpoint_dir(&output_dir, step),
                    config.tokenizer_path(),
                )?;
            }
        }
    }
    pb.finish_with_message("done");

    if !loss_acc.is_empty() {
        flush_logs::<B, M, O>(objective, &mut state, &mut loss_acc, lr);
    }

    tracing::info!(
        steps = state.global_step - start_step,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training loop finished"
    );

    save_training_checkpoint::<B, M, _>(
        &model,
        &optimizer,
        &state,
        &output_dir,
        config.tokenizer_path(),
    )?;
    Ok((model, state))
}
