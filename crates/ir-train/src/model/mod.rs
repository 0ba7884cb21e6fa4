//! Retrieval model components: representation heads (sparse SPLADE pooling or
//! dense CLS pooling), the two-tower dual encoder, the cross-encoder scorer,
//! and the tensor bridge for precomputed token features.

pub mod bridge;
pub mod cross_encoder;
pub mod dual_encoder;
pub mod encoder;

use burn::prelude::*;

use crate::error::Result;
use bridge::EncodedInput;

/// A joint encoder scoring (query, candidate) pairs.
pub trait CrossEncoderModel<B: Backend> {
    /// Relevance logits for each pair, shape `(rows, num_labels)`.
    /// Column 0 is the relevance logit.
    fn relevance_logits(&self, pairs: EncodedInput<B>) -> Tensor<B, 2>;
}

/// Independent query and document encoders producing vector representations.
pub trait DualEncoderModel<B: Backend> {
    /// Encode one query per batch element and its group of candidates.
    ///
    /// `docs` holds `batch * n_candidates` rows, grouped per query.
    /// Returns `(queries, docs)` shaped `(batch, 1, dim)` and
    /// `(batch, n_candidates, dim)`.
    fn encode(
        &self,
        queries: EncodedInput<B>,
        docs: EncodedInput<B>,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)>;

    /// Whether representations are sparse (SPLADE pooled).
    fn is_sparse(&self) -> bool;
}
