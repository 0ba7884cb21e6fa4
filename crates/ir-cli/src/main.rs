mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::TrainArgs;

/// ir-train: train sparse/dense retrieval encoders and rerankers with
/// contrastive and distillation objectives.
#[derive(Parser)]
#[command(name = "ir-train", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model on query-group JSONL data.
    Train {
        /// Path to training config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Path to the query-group JSONL file.
        #[arg(long)]
        data: PathBuf,
        /// Directory for checkpoints and the final model.
        #[arg(long, default_value = "checkpoints/ir")]
        output_dir: PathBuf,
        /// Checkpoint directory to resume from (weights, optimizer, trainer state).
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// Tokenizer artifact to store alongside every checkpoint.
        #[arg(long)]
        tokenizer: Option<PathBuf>,
        /// Override the peak learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Override the number of query groups per step.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the number of epochs.
        #[arg(long)]
        num_epochs: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            data,
            output_dir,
            resume_from,
            tokenizer,
            lr,
            batch_size,
            num_epochs,
        } => {
            let summary = pipeline::run_train(TrainArgs {
                config,
                data,
                output_dir,
                resume_from,
                tokenizer,
                lr,
                batch_size,
                num_epochs,
            })?;
            tracing::info!(
                kind = %summary.kind,
                steps = summary.state.global_step,
                num_params = summary.num_params,
                "Training finished"
            );
            Ok(())
        }
    }
}
