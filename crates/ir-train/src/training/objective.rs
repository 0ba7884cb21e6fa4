//! The objective seam between the training-loop driver and the loss logic.
//!
//! An [`Objective`] is a strategy object: the driver calls
//! [`Objective::compute_loss`] once per batch and [`Objective::log`] once per
//! logging interval. Four strategies are provided: cross-encoder contrastive
//! ([`RerankerObjective`](super::reranker::RerankerObjective)), cross-encoder
//! with distillation ([`RerankerDistilObjective`](super::reranker::RerankerDistilObjective)),
//! dual-encoder distillation with sparsity
//! ([`DistilObjective`](super::dual::DistilObjective)) and dual-encoder
//! first-stage training without a teacher
//! ([`FirstStageObjective`](super::dual::FirstStageObjective)).

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::model::bridge::EncodedInput;
use crate::training::loss::DistillationMode;
use crate::training::metrics::{round2, LogRecord};
use crate::training::regularization::SparsityRegularizer;
use crate::training::trainer::TrainState;

/// Joint (query, candidate) inputs for a cross-encoder.
///
/// `pairs` holds `batch * (n_negatives + 1)` rows grouped per query, positive
/// first. `scores` are teacher scores in the same order.
#[derive(Debug, Clone)]
pub struct RerankerBatch<B: Backend> {
    pub pairs: EncodedInput<B>,
    pub scores: Option<Tensor<B, 1>>,
}

/// Separate query and candidate inputs for a dual encoder.
///
/// `queries` has one row per query; `docs` holds `batch * (n_negatives + 1)`
/// rows grouped per query, positive first.
#[derive(Debug, Clone)]
pub struct DualEncoderBatch<B: Backend> {
    pub queries: EncodedInput<B>,
    pub docs: EncodedInput<B>,
    pub scores: Option<Tensor<B, 1>>,
}

/// Raw model outputs, returned alongside the loss on request.
#[derive(Debug, Clone)]
pub enum ModelOutput<B: Backend> {
    /// Cross-encoder logits, `(rows, num_labels)`.
    Logits(Tensor<B, 2>),
    /// Dual-encoder representations, `(batch, 1, dim)` and `(batch, n + 1, dim)`.
    Representations {
        queries: Tensor<B, 3>,
        docs: Tensor<B, 3>,
    },
}

/// Result of one `compute_loss` call.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    /// Scalar loss, shape `(1,)`.
    pub loss: Tensor<B, 1>,
    pub outputs: Option<ModelOutput<B>>,
}

/// A per-batch loss strategy for model type `M`.
pub trait Objective<B: Backend, M> {
    type Batch;

    /// Short human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Compute the training loss for one batch.
    fn compute_loss(
        &mut self,
        model: &M,
        batch: Self::Batch,
        return_outputs: bool,
    ) -> Result<StepOutput<B>>;

    /// Fill `logs` at a flush. The default only reports the epoch fraction.
    fn log(&mut self, state: &TrainState, logs: &mut LogRecord) {
        logs.epoch = Some(round2(state.epoch));
    }
}

/// Which of the four training strategies to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Cross-encoder, contrastive only.
    Reranker,
    /// Cross-encoder, contrastive + distillation.
    RerankerDistil,
    /// Dual encoder, contrastive + distillation + sparsity.
    Distil,
    /// Dual encoder, contrastive + sparsity, no teacher.
    FirstStage,
}

impl ObjectiveKind {
    pub fn is_dual_encoder(self) -> bool {
        matches!(self, Self::Distil | Self::FirstStage)
    }

    pub fn uses_teacher(self) -> bool {
        matches!(self, Self::RerankerDistil | Self::Distil)
    }
}

impl std::fmt::Display for ObjectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reranker => "reranker",
            Self::RerankerDistil => "reranker_distil",
            Self::Distil => "distil",
            Self::FirstStage => "first_stage",
        };
        f.write_str(name)
    }
}

/// Objective settings loaded from the `[objective]` TOML section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    pub kind: ObjectiveKind,

    /// Negatives per query; each group has `n_negatives + 1` candidates.
    #[serde(default = "default_n_negatives")]
    pub n_negatives: usize,

    /// Document FLOPS weight (`l0d`).
    #[serde(default = "default_lambda_d")]
    pub lambda_d: f64,

    /// Query L1 weight (`l0q`).
    #[serde(default = "default_lambda_q")]
    pub lambda_q: f64,

    /// KL-divergence or margin-MSE distillation.
    #[serde(default)]
    pub distillation: DistillationMode,

    /// Sparsify documents only: no L1 term on queries.
    #[serde(default)]
    pub splade_doc: bool,

    /// Dense model: no sparsity regularization or sparsity metrics.
    #[serde(default)]
    pub dense: bool,

    /// Query and document encoders share weights.
    #[serde(default = "default_shared_weights")]
    pub shared_weights: bool,
}

fn default_n_negatives() -> usize {
    7
}
fn default_lambda_d() -> f64 {
    5e-4
}
fn default_lambda_q() -> f64 {
    3e-4
}
fn default_shared_weights() -> bool {
    true
}

impl ObjectiveConfig {
    pub fn new(kind: ObjectiveKind) -> Self {
        Self {
            kind,
            n_negatives: default_n_negatives(),
            lambda_d: default_lambda_d(),
            lambda_q: default_lambda_q(),
            distillation: DistillationMode::default(),
            splade_doc: false,
            dense: false,
            shared_weights: default_shared_weights(),
        }
    }

    pub fn regularizer(&self) -> SparsityRegularizer {
        SparsityRegularizer {
            lambda_d: self.lambda_d,
            lambda_q: self.lambda_q,
            splade_doc: self.splade_doc,
        }
    }

    /// Log warnings for settings that have no effect for the chosen kind.
    pub fn validate(&self) {
        if !self.kind.is_dual_encoder() && (self.dense || self.splade_doc) {
            tracing::warn!(
                kind = %self.kind,
                "dense/splade_doc only apply to dual-encoder objectives"
            );
        }
        if self.kind.is_dual_encoder() && self.dense && self.splade_doc {
            tracing::warn!("splade_doc is ignored for dense models");
        }
        if self.lambda_d < 0.0 || self.lambda_q < 0.0 {
            tracing::warn!(
                lambda_d = self.lambda_d,
                lambda_q = self.lambda_q,
                "negative sparsity weights reward dense representations"
            );
        }
    }
}

/// Reshape flat teacher scores onto the `(batch, n_candidates)` student grid.
pub(crate) fn teacher_grid<B: Backend>(
    scores: Option<Tensor<B, 1>>,
    dims: [usize; 2],
) -> Result<Tensor<B, 2>> {
    let scores = scores.ok_or(TrainError::MissingTeacherScores)?;
    let expected = dims[0] * dims[1];
    let actual = scores.dims()[0];
    if actual != expected {
        return Err(TrainError::ScoreCountMismatch { expected, actual });
    }
    Ok(scores.reshape(dims))
}
