//! Training pipeline: config + data -> model + objective -> training loop.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::AutodiffBackend;

use ir_train::training::checkpoint::CheckpointModel;
use ir_train::training::data::{Collate, GroupDataset};
use ir_train::training::dual::{DistilObjective, FirstStageObjective};
use ir_train::training::objective::{Objective, ObjectiveKind};
use ir_train::training::reranker::{RerankerDistilObjective, RerankerObjective};
use ir_train::training::trainer::{train, TrainState, TrainingConfig};

use crate::config::{build_training_config, load_train_toml, CliOverrides};

type TrainBackend = Autodiff<NdArray<f32>>;

/// Model head config saved in the output directory.
pub const MODEL_CONFIG_NAME: &str = "model_config.json";
/// Resolved training-loop config saved in the output directory.
pub const TRAINING_CONFIG_NAME: &str = "training_config.json";

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the training config TOML file.
    pub config: PathBuf,
    /// Path to the query-group JSONL file.
    pub data: PathBuf,
    /// Directory for checkpoints and the final model.
    pub output_dir: PathBuf,
    /// Checkpoint directory to resume from.
    pub resume_from: Option<PathBuf>,
    /// Tokenizer artifact copied into every checkpoint.
    pub tokenizer: Option<PathBuf>,
    pub lr: Option<f64>,
    pub batch_size: Option<usize>,
    pub num_epochs: Option<usize>,
}

/// Final numbers of a finished run.
#[derive(Debug)]
pub struct TrainSummary {
    pub kind: ObjectiveKind,
    pub num_params: usize,
    pub state: TrainState,
}

/// Train a model per the config file and write checkpoints to the output dir.
pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainSummary> {
    let start = Instant::now();

    // 1. Load config
    let toml = load_train_toml(&args.config)?;
    toml.objective.validate();
    let cli = CliOverrides {
        output_dir: args.output_dir.clone(),
        tokenizer: args.tokenizer.clone(),
        lr: args.lr,
        batch_size: args.batch_size,
        num_epochs: args.num_epochs,
    };
    let training = build_training_config(&toml.training, &cli)?;

    // 2. Load data
    let objective_config = &toml.objective;
    let dataset = GroupDataset::load(&args.data, objective_config.n_negatives)?;
    if dataset.is_empty() {
        anyhow::bail!("no query groups in {}", args.data.display());
    }
    if dataset.dim() != toml.model.d_model {
        anyhow::bail!(
            "token features are {}-wide but model.d_model is {}",
            dataset.dim(),
            toml.model.d_model
        );
    }
    if objective_config.kind.uses_teacher() && !dataset.has_teacher_scores() {
        anyhow::bail!(
            "objective {} needs teacher scores on every query group",
            objective_config.kind
        );
    }

    // 3. Build model + objective, then train
    let device = Default::default();
    let resume = args.resume_from.as_deref();
    let n = objective_config.n_negatives;
    let kind = objective_config.kind;

    let output_dir = args.output_dir.as_path();
    std::fs::create_dir_all(output_dir)?;

    let (num_params, state) = match kind {
        ObjectiveKind::Reranker | ObjectiveKind::RerankerDistil => {
            let model_config = toml.model.cross_encoder_config();
            save_json(&output_dir.join(MODEL_CONFIG_NAME), &model_config)?;
            let model = model_config.init::<TrainBackend>(&device);
            if kind == ObjectiveKind::Reranker {
                let mut objective = RerankerObjective::new(n);
                fit::<TrainBackend, _, _>(&training, model, &mut objective, &dataset, &device, resume)?
            } else {
                let mut objective = RerankerDistilObjective::new(n, objective_config.distillation);
                fit::<TrainBackend, _, _>(&training, model, &mut objective, &dataset, &device, resume)?
            }
        }
        ObjectiveKind::Distil | ObjectiveKind::FirstStage => {
            let model_config = toml.model.dual_encoder_config(objective_config);
            save_json(&output_dir.join(MODEL_CONFIG_NAME), &model_config)?;
            let model = model_config.init::<TrainBackend>(&device);
            if kind == ObjectiveKind::Distil {
                let mut objective = DistilObjective::new(objective_config);
                fit::<TrainBackend, _, _>(&training, model, &mut objective, &dataset, &device, resume)?
            } else {
                let mut objective = FirstStageObjective::new(objective_config);
                fit::<TrainBackend, _, _>(&training, model, &mut objective, &dataset, &device, resume)?
            }
        }
    };

    // 4. Save the resolved training config next to the weights
    save_json(&output_dir.join(TRAINING_CONFIG_NAME), &training)?;

    // 5. Print summary
    let elapsed = start.elapsed();
    println!("\n--- Training Summary ---");
    println!("Objective: {kind}");
    println!("Parameters: {num_params}");
    println!("Steps: {}", state.global_step);
    println!("Epoch: {:.2}", state.epoch);
    if let Some(last) = state.log_history.last() {
        println!("Last log: {}", last.display());
    }
    println!("Output: {}", args.output_dir.display());
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());

    Ok(TrainSummary {
        kind,
        num_params,
        state,
    })
}

fn save_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn fit<B, M, O>(
    config: &TrainingConfig,
    model: M,
    objective: &mut O,
    dataset: &GroupDataset,
    device: &B::Device,
    resume_from: Option<&Path>,
) -> anyhow::Result<(usize, TrainState)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + CheckpointModel<B>,
    O: Objective<B, M>,
    O::Batch: Collate<B>,
{
    let num_params = model.num_params();
    tracing::info!(objective = objective.name(), num_params, "Initialized model");
    let (_model, state) = train::<B, M, O>(config, model, objective, dataset, device, resume_from)?;
    Ok((num_params, state))
}
