//! Contrastive and distillation losses for retrieval training.
//!
//! All functions are generic over `B: Backend` and operate on burn tensors.
//! Convention: candidate index 0 is the positive; higher score = more relevant.

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};

/// Weights of the final convex combination `contrastive * ce + distillation * distil`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub contrastive: f64,
    pub distillation: f64,
}

/// Cross-encoder distillation favours the teacher signal 9:1.
pub const RERANKER_WEIGHTS: LossWeights = LossWeights {
    contrastive: 0.1,
    distillation: 0.9,
};

/// Dual-encoder distillation favours the teacher signal 99:1.
pub const DUAL_ENCODER_WEIGHTS: LossWeights = LossWeights {
    contrastive: 0.01,
    distillation: 0.99,
};

impl LossWeights {
    pub fn combine<B: Backend>(
        &self,
        contrastive: Tensor<B, 1>,
        distillation: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        contrastive * self.contrastive + distillation * self.distillation
    }
}

/// How the student is matched to the teacher's scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillationMode {
    /// KL(teacher || student) over softmax distributions across candidates.
    #[default]
    KlDiv,
    /// MSE between (positive − negative) score margins.
    MarginMse,
}

impl std::fmt::Display for DistillationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KlDiv => write!(f, "KL-divergence"),
            Self::MarginMse => write!(f, "margin-MSE"),
        }
    }
}

/// Cross-entropy with class 0 as the correct candidate, averaged over the batch.
///
/// # Arguments
/// - `scores`: shape `(batch, n_candidates)`, positive at index 0
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`.
pub fn contrastive_loss<B: Backend>(scores: Tensor<B, 2>) -> Tensor<B, 1> {
    let device = scores.device();
    let [batch_size, _] = scores.dims();
    let labels = Tensor::<B, 1, Int>::zeros([batch_size], &device);

    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(scores, labels)
}

/// Per-query dot products against the query's own candidates.
///
/// `queries`: `(batch, 1, dim)`, `docs`: `(batch, n_candidates, dim)`.
/// Returns `(batch, n_candidates)`.
pub fn paired_scores<B: Backend>(queries: Tensor<B, 3>, docs: Tensor<B, 3>) -> Tensor<B, 2> {
    queries.matmul(docs.swap_dims(1, 2)).squeeze::<2>(1)
}

/// Scores with in-batch negative expansion.
///
/// Column 0 is each query's own positive. The remaining `batch * n_negatives`
/// columns score every query against every negative in the batch, not only
/// the negatives paired with it.
///
/// Returns `(batch, 1 + batch * n_negatives)`.
pub fn in_batch_scores<B: Backend>(queries: Tensor<B, 3>, docs: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, n_candidates, dim] = docs.dims();
    let q = queries.reshape([batch, dim]);

    let positives = docs.clone().slice([0..batch, 0..1, 0..dim]).reshape([batch, dim]);
    let scores_positive = (q.clone() * positives).sum_dim(1); // (batch, 1)

    let n_negatives = n_candidates - 1;
    if n_negatives == 0 {
        return scores_positive;
    }

    let negatives = docs
        .slice([0..batch, 1..n_candidates, 0..dim])
        .reshape([batch * n_negatives, dim]);
    let scores_negative = q.matmul(negatives.transpose()); // (batch, batch * n_negatives)

    Tensor::cat(vec![scores_positive, scores_negative], 1)
}

/// Distillation loss between student and teacher scores.
///
/// Both inputs are `(batch, n_candidates)` with the positive at index 0.
///
/// - [`DistillationMode::MarginMse`]: squared error between student and
///   teacher margins `s[:, 0] - s[:, j]`, averaged over negatives, then batch.
/// - [`DistillationMode::KlDiv`]: `sum_j p_j (log p_j - log q_j)` with
///   `p = softmax(teacher)`, `q = softmax(student)`, averaged over the batch.
pub fn distillation_loss<B: Backend>(
    mode: DistillationMode,
    student: Tensor<B, 2>,
    teacher: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match mode {
        DistillationMode::MarginMse => margin_mse_loss(student, teacher),
        DistillationMode::KlDiv => kl_div_loss(student, teacher),
    }
}

/// Margin-MSE distillation. With a single candidate there are no margins and
/// the loss is zero.
pub fn margin_mse_loss<B: Backend>(student: Tensor<B, 2>, teacher: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, n_candidates] = student.dims();
    if n_candidates < 2 {
        return Tensor::zeros([1], &student.device());
    }

    let margins = |scores: Tensor<B, 2>| {
        let positive = scores.clone().slice([0..batch, 0..1]);
        let negative = scores.slice([0..batch, 1..n_candidates]);
        positive - negative // broadcast (batch, 1) over (batch, n_negatives)
    };

    let diff = margins(student) - margins(teacher);
    diff.powf_scalar(2.0).mean_dim(1).mean()
}

/// KL-divergence distillation at temperature 1.
pub fn kl_div_loss<B: Backend>(student: Tensor<B, 2>, teacher: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_q = log_softmax(student, 1);
    let log_p = log_softmax(teacher.clone(), 1);
    let p = softmax(teacher, 1);

    (p * (log_p - log_q)).sum_dim(1).mean()
}
