//! Sparsity regularizers for SPLADE-style representations.
//!
//! All inputs are `(rows, dim)` representation matrices unless noted.

use burn::prelude::*;

use crate::model::bridge::tensor_to_f64;

/// FLOPS surrogate: `sum_j (mean_i |x_ij|)^2`.
pub fn flops<B: Backend>(reps: Tensor<B, 2>) -> Tensor<B, 1> {
    reps.abs().mean_dim(0).powf_scalar(2.0).sum()
}

/// Mean L1 norm of each row.
pub fn l1<B: Backend>(reps: Tensor<B, 2>) -> Tensor<B, 1> {
    reps.abs().sum_dim(1).mean()
}

/// Mean count of strictly nonzero entries per row. Reporting only.
pub fn l0<B: Backend>(reps: Tensor<B, 2>) -> Tensor<B, 1> {
    reps.not_equal_elem(0.0).float().sum_dim(1).mean()
}

/// Anti-collapse penalty: `1 / (sum q)^2 + 1 / (sum d)^2`.
///
/// Diverges as either side collapses to all-zero. Not guarded against an
/// exact zero sum; the result is then infinite.
pub fn anti_zero<B: Backend>(queries: Tensor<B, 3>, docs: Tensor<B, 3>) -> Tensor<B, 1> {
    queries.sum().powf_scalar(2.0).recip() + docs.sum().powf_scalar(2.0).recip()
}

/// Regularization weights and switches for a sparse dual encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsityRegularizer {
    /// Weight of the document FLOPS term.
    pub lambda_d: f64,
    /// Weight of the query L1 term.
    pub lambda_q: f64,
    /// Document-only sparsification: queries get no L1 term.
    pub splade_doc: bool,
}

/// Loss terms and sparsity statistics from one step.
#[derive(Debug, Clone)]
pub struct SparsityTerms<B: Backend> {
    /// `lambda_d * flops(docs)` plus `lambda_q * l1(queries)` unless `splade_doc`.
    pub flops: Tensor<B, 1>,
    pub anti_zero: Tensor<B, 1>,
    /// Mean nonzeros per document representation.
    pub l0_docs: f64,
    /// Mean nonzeros per query representation.
    pub l0_queries: f64,
}

impl<B: Backend> SparsityTerms<B> {
    /// The quantity added to the training loss.
    pub fn penalty(&self) -> Tensor<B, 1> {
        self.flops.clone() + self.anti_zero.clone()
    }
}

impl SparsityRegularizer {
    /// `queries`: `(batch, 1, dim)`, `docs`: `(batch, n_candidates, dim)`.
    pub fn apply<B: Backend>(&self, queries: Tensor<B, 3>, docs: Tensor<B, 3>) -> SparsityTerms<B> {
        let [batch, n_candidates, dim] = docs.dims();
        let [q_batch, q_rows, _] = queries.dims();
        let flat_docs = docs.clone().reshape([batch * n_candidates, dim]);
        let flat_queries = queries.clone().reshape([q_batch * q_rows, dim]);

        let mut flops_term = flops(flat_docs.clone()) * self.lambda_d;
        if !self.splade_doc {
            flops_term = flops_term + l1(flat_queries.clone()) * self.lambda_q;
        }

        SparsityTerms {
            flops: flops_term,
            anti_zero: anti_zero(queries, docs),
            l0_docs: tensor_to_f64(l0(flat_docs.detach())),
            l0_queries: tensor_to_f64(l0(flat_queries.detach())),
        }
    }
}
