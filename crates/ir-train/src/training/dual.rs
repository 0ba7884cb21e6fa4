//! Dual-encoder objectives: distillation + sparsity, and first-stage
//! contrastive + sparsity without a teacher.
//!
//! Both score queries against their own candidates by dot product and expand
//! the contrastive term with every other query's negatives in the batch.
//! Sparse (non-dense) models add the FLOPS/L1 regularizer and the
//! anti-collapse penalty, and report L0 sparsity.

use burn::prelude::*;

use crate::error::{Result, TrainError};
use crate::model::bridge::tensor_to_f64;
use crate::model::DualEncoderModel;
use crate::training::loss::{
    contrastive_loss, distillation_loss, in_batch_scores, paired_scores, DistillationMode,
    LossWeights, DUAL_ENCODER_WEIGHTS,
};
use crate::training::metrics::{round2, LogRecord, LossMetrics, Metric};
use crate::training::objective::{
    teacher_grid, DualEncoderBatch, ModelOutput, Objective, ObjectiveConfig, StepOutput,
};
use crate::training::regularization::SparsityRegularizer;
use crate::training::trainer::TrainState;

const SPARSITY_METRICS: [Metric; 4] = [
    Metric::L0Docs,
    Metric::L0Queries,
    Metric::FlopsLoss,
    Metric::AntiZero,
];

/// Settings shared by both dual-encoder objectives.
#[derive(Debug, Clone, Copy)]
struct DualSettings {
    n_negatives: usize,
    regularizer: SparsityRegularizer,
    dense: bool,
}

impl DualSettings {
    fn from_config(config: &ObjectiveConfig) -> Self {
        Self {
            n_negatives: config.n_negatives,
            regularizer: config.regularizer(),
            dense: config.dense,
        }
    }

    /// Encode a batch and check the candidate count and pooling kind.
    fn encode<B: Backend, M: DualEncoderModel<B>>(
        &self,
        model: &M,
        batch: DualEncoderBatch<B>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>, Option<Tensor<B, 1>>)> {
        let DualEncoderBatch {
            queries,
            docs,
            scores,
        } = batch;
        if model.is_sparse() == self.dense {
            let (model_kind, objective_kind) = if self.dense {
                ("sparse", "dense")
            } else {
                ("dense", "sparse")
            };
            return Err(TrainError::ModelMismatch(format!(
                "{model_kind} model given to a {objective_kind} objective"
            )));
        }
        let (queries, docs) = model.encode(queries, docs)?;
        let n_candidates = docs.dims()[1];
        if n_candidates != self.n_negatives + 1 {
            return Err(TrainError::InvalidBatch(format!(
                "expected {} candidates per query, got {n_candidates}",
                self.n_negatives + 1
            )));
        }
        Ok((queries, docs, scores))
    }

    /// Add the sparsity terms to `loss` and record their metrics. No-op for
    /// dense models.
    fn regularize<B: Backend>(
        &self,
        loss: Tensor<B, 1>,
        queries: Tensor<B, 3>,
        docs: Tensor<B, 3>,
        metrics: &mut LossMetrics,
    ) -> Tensor<B, 1> {
        if self.dense {
            return loss;
        }
        let terms = self.regularizer.apply(queries, docs);
        metrics.record(Metric::L0Docs, terms.l0_docs);
        metrics.record(Metric::L0Queries, terms.l0_queries);
        metrics.record(Metric::FlopsLoss, tensor_to_f64(terms.flops.clone().detach()));
        metrics.record(Metric::AntiZero, tensor_to_f64(terms.anti_zero.clone().detach()));
        loss + terms.penalty()
    }

    fn flush(&self, metrics: &mut LossMetrics, state: &TrainState, logs: &mut LogRecord, with_distil: bool) {
        logs.epoch = Some(round2(state.epoch));
        let mut keys = Vec::with_capacity(6);
        if !self.dense {
            keys.extend(SPARSITY_METRICS);
        }
        keys.push(Metric::CeLoss);
        if with_distil {
            keys.push(Metric::DistilLoss);
        }
        metrics.flush_into(&keys, logs);
    }
}

/// In-batch contrastive loss + teacher distillation + sparsity.
#[derive(Debug, Clone)]
pub struct DistilObjective {
    settings: DualSettings,
    mode: DistillationMode,
    weights: LossWeights,
    metrics: LossMetrics,
    step: usize,
}

impl DistilObjective {
    pub fn new(config: &ObjectiveConfig) -> Self {
        Self {
            settings: DualSettings::from_config(config),
            mode: config.distillation,
            weights: DUAL_ENCODER_WEIGHTS,
            metrics: LossMetrics::new(),
            step: 0,
        }
    }

    /// Number of `compute_loss` calls so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn metrics(&self) -> &LossMetrics {
        &self.metrics
    }
}

impl<B: Backend, M: DualEncoderModel<B>> Objective<B, M> for DistilObjective {
    type Batch = DualEncoderBatch<B>;

    fn name(&self) -> &'static str {
        "distil"
    }

    fn compute_loss(
        &mut self,
        model: &M,
        batch: DualEncoderBatch<B>,
        return_outputs: bool,
    ) -> Result<StepOutput<B>> {
        if batch.scores.is_none() {
            return Err(TrainError::MissingTeacherScores);
        }
        self.step += 1;

        let (queries, docs, teacher) = self.settings.encode(model, batch)?;

        let scores = paired_scores(queries.clone(), docs.clone());
        let teacher = teacher_grid(teacher, scores.dims())?;
        let distil = distillation_loss(self.mode, scores, teacher);

        let ce = contrastive_loss(in_batch_scores(queries.clone(), docs.clone()));

        self.metrics.record(Metric::CeLoss, tensor_to_f64(ce.clone().detach()));
        self.metrics.record(Metric::DistilLoss, tensor_to_f64(distil.clone().detach()));

        let loss = self.weights.combine(ce, distil);
        let loss = self
            .settings
            .regularize(loss, queries.clone(), docs.clone(), &mut self.metrics);

        tracing::debug!(step = self.step, "distil objective step");
        Ok(StepOutput {
            loss,
            outputs: return_outputs.then(|| ModelOutput::Representations { queries, docs }),
        })
    }

    fn log(&mut self, state: &TrainState, logs: &mut LogRecord) {
        self.settings.flush(&mut self.metrics, state, logs, true);
    }
}

/// In-batch contrastive loss + sparsity, for training without a teacher.
///
/// Teacher scores, if present in the batch, are ignored.
#[derive(Debug, Clone)]
pub struct FirstStageObjective {
    settings: DualSettings,
    metrics: LossMetrics,
    step: usize,
}

impl FirstStageObjective {
    pub fn new(config: &ObjectiveConfig) -> Self {
        Self {
            settings: DualSettings::from_config(config),
            metrics: LossMetrics::new(),
            step: 0,
        }
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn metrics(&self) -> &LossMetrics {
        &self.metrics
    }
}

impl<B: Backend, M: DualEncoderModel<B>> Objective<B, M> for FirstStageObjective {
    type Batch = DualEncoderBatch<B>;

    fn name(&self) -> &'static str {
        "first_stage"
    }

    fn compute_loss(
        &mut self,
        model: &M,
        batch: DualEncoderBatch<B>,
        return_outputs: bool,
    ) -> Result<StepOutput<B>> {
        self.step += 1;
        let (queries, docs, _teacher) = self.settings.encode(model, batch)?;

        let ce = contrastive_loss(in_batch_scores(queries.clone(), docs.clone()));
        self.metrics.record(Metric::CeLoss, tensor_to_f64(ce.clone().detach()));

        let loss = self
            .settings
            .regularize(ce, queries.clone(), docs.clone(), &mut self.metrics);

        tracing::debug!(step = self.step, "first-stage objective step");
        Ok(StepOutput {
            loss,
            outputs: return_outputs.then(|| ModelOutput::Representations { queries, docs }),
        })
    }

    fn log(&mut self, state: &TrainState, logs: &mut LogRecord) {
        self.settings.flush(&mut self.metrics, state, logs, false);
    }
}
