//! Cross-encoder objectives: contrastive, and contrastive + distillation.

use burn::prelude::*;

use crate::error::{Result, TrainError};
use crate::model::bridge::tensor_to_f64;
use crate::model::CrossEncoderModel;
use crate::training::loss::{
    contrastive_loss, distillation_loss, DistillationMode, LossWeights, RERANKER_WEIGHTS,
};
use crate::training::metrics::{round2, LogRecord, LossMetrics, Metric};
use crate::training::objective::{
    teacher_grid, ModelOutput, Objective, RerankerBatch, StepOutput,
};
use crate::training::trainer::TrainState;

/// Column 0 of the logits regrouped as `(batch, n_negatives + 1)`.
fn relevance_grid<B: Backend>(logits: Tensor<B, 2>, n_negatives: usize) -> Result<Tensor<B, 2>> {
    let [rows, _labels] = logits.dims();
    let group = n_negatives + 1;
    if rows == 0 || rows % group != 0 {
        return Err(TrainError::InvalidBatch(format!(
            "{rows} scored pairs cannot be grouped into candidate lists of {group}"
        )));
    }
    Ok(logits.slice([0..rows, 0..1]).reshape([rows / group, group]))
}

/// Contrastive cross-entropy over one positive and `n_negatives` negatives.
#[derive(Debug, Clone)]
pub struct RerankerObjective {
    n_negatives: usize,
}

impl RerankerObjective {
    pub fn new(n_negatives: usize) -> Self {
        Self { n_negatives }
    }
}

impl<B: Backend, M: CrossEncoderModel<B>> Objective<B, M> for RerankerObjective {
    type Batch = RerankerBatch<B>;

    fn name(&self) -> &'static str {
        "reranker"
    }

    fn compute_loss(
        &mut self,
        model: &M,
        batch: RerankerBatch<B>,
        return_outputs: bool,
    ) -> Result<StepOutput<B>> {
        // Teacher scores are not part of the model input.
        let RerankerBatch { pairs, scores: _ } = batch;
        let logits = model.relevance_logits(pairs);
        let scores = relevance_grid(logits.clone(), self.n_negatives)?;
        let loss = contrastive_loss(scores);

        Ok(StepOutput {
            loss,
            outputs: return_outputs.then(|| ModelOutput::Logits(logits)),
        })
    }
}

/// Contrastive loss blended with teacher distillation.
#[derive(Debug, Clone)]
pub struct RerankerDistilObjective {
    n_negatives: usize,
    mode: DistillationMode,
    weights: LossWeights,
    metrics: LossMetrics,
}

impl RerankerDistilObjective {
    pub fn new(n_negatives: usize, mode: DistillationMode) -> Self {
        Self {
            n_negatives,
            mode,
            weights: RERANKER_WEIGHTS,
            metrics: LossMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &LossMetrics {
        &self.metrics
    }
}

impl<B: Backend, M: CrossEncoderModel<B>> Objective<B, M> for RerankerDistilObjective {
    type Batch = RerankerBatch<B>;

    fn name(&self) -> &'static str {
        "reranker_distil"
    }

    fn compute_loss(
        &mut self,
        model: &M,
        batch: RerankerBatch<B>,
        return_outputs: bool,
    ) -> Result<StepOutput<B>> {
        let RerankerBatch { pairs, scores: teacher } = batch;
        if teacher.is_none() {
            return Err(TrainError::MissingTeacherScores);
        }

        let logits = model.relevance_logits(pairs);
        let scores = relevance_grid(logits.clone(), self.n_negatives)?;
        let teacher = teacher_grid(teacher, scores.dims())?;

        let ce = contrastive_loss(scores.clone());
        let distil = distillation_loss(self.mode, scores, teacher);

        self.metrics.record(Metric::CeLoss, tensor_to_f64(ce.clone().detach()));
        self.metrics.record(Metric::DistilLoss, tensor_to_f64(distil.clone().detach()));

        let loss = self.weights.combine(ce, distil);
        Ok(StepOutput {
            loss,
            outputs: return_outputs.then(|| ModelOutput::Logits(logits)),
        })
    }

    fn log(&mut self, state: &TrainState, logs: &mut LogRecord) {
        logs.epoch = Some(round2(state.epoch));
        self.metrics
            .flush_into(&[Metric::CeLoss, Metric::DistilLoss], logs);
    }
}
