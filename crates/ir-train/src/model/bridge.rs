//! Tensor bridge: converts precomputed token features (`Vec<f32>` per token)
//! into padded burn tensors, and extracts scalars back out.
//!
//! The transformer body and tokenizer live outside this crate. They hand us
//! one feature vector per token; everything downstream of that is burn.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{Result, TrainError};

/// A padded batch of token sequences.
///
/// `features` is `(rows, seq, d_model)`; `attention_mask` is `(rows, seq)`
/// with 1.0 on real tokens and 0.0 on padding.
#[derive(Debug, Clone)]
pub struct EncodedInput<B: Backend> {
    pub features: Tensor<B, 3>,
    pub attention_mask: Tensor<B, 2>,
}

impl<B: Backend> EncodedInput<B> {
    pub fn new(features: Tensor<B, 3>, attention_mask: Tensor<B, 2>) -> Self {
        Self {
            features,
            attention_mask,
        }
    }

    /// Number of sequences in the batch.
    pub fn rows(&self) -> usize {
        self.features.dims()[0]
    }
}

/// Pad a batch of token-feature sequences into an [`EncodedInput`].
///
/// Every token vector must have the same width, and every sequence must hold
/// at least one token.
pub fn sequences_to_input<B: Backend>(
    sequences: &[&[Vec<f32>]],
    device: &B::Device,
) -> Result<EncodedInput<B>> {
    if sequences.is_empty() {
        return Err(TrainError::InvalidBatch("no sequences to encode".into()));
    }
    let dim = sequences[0]
        .first()
        .map(|t| t.len())
        .ok_or_else(|| TrainError::InvalidBatch("sequence 0 is empty".into()))?;
    if dim == 0 {
        return Err(TrainError::InvalidBatch("token feature width must be > 0".into()));
    }

    let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let rows = sequences.len();
    let mut flat = vec![0.0_f32; rows * max_len * dim];
    let mut mask = vec![0.0_f32; rows * max_len];

    for (i, seq) in sequences.iter().enumerate() {
        if seq.is_empty() {
            return Err(TrainError::InvalidBatch(format!("sequence {i} is empty")));
        }
        for (j, token) in seq.iter().enumerate() {
            if token.len() != dim {
                return Err(TrainError::InvalidBatch(format!(
                    "sequence {i} token {j} has width {}, expected {dim}",
                    token.len()
                )));
            }
            let offset = (i * max_len + j) * dim;
            flat[offset..offset + dim].copy_from_slice(token);
            mask[i * max_len + j] = 1.0;
        }
    }

    let features = Tensor::from_data(TensorData::new(flat, [rows, max_len, dim]), device);
    let attention_mask = Tensor::from_data(TensorData::new(mask, [rows, max_len]), device);
    Ok(EncodedInput::new(features, attention_mask))
}

/// Build a flat 1D tensor from `f32` values (teacher scores).
pub fn values_to_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

/// Extract a single f64 scalar from a one-element burn tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
