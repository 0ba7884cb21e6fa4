use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{gelu, relu};

use crate::model::bridge::EncodedInput;

/// SPLADE max pooling: `max over seq of log(1 + relu(x)) * mask`.
///
/// `logits`: `(rows, seq, vocab)`, `attention_mask`: `(rows, seq)`.
/// Returns `(rows, vocab)`, non-negative, zero wherever no real token fires.
pub fn splade_max<B: Backend>(logits: Tensor<B, 3>, attention_mask: Tensor<B, 2>) -> Tensor<B, 2> {
    let activated = relu(logits).log1p();
    let masked = activated * attention_mask.unsqueeze_dim::<3>(2);
    // Reduce over the last axis: (rows, vocab, seq) -> (rows, vocab).
    masked.swap_dims(1, 2).max_dim(2).squeeze::<2>(2)
}

/// Configuration for a [`RepresentationHead`].
///
/// ```text
/// (rows, seq, d_model)
///   → Linear(d_model→d_model) → GELU → Dropout
///   → Linear(d_model→d_output)            (MLM-style projection)
///   → sparse: splade_max over seq  |  dense: first (CLS) token
///   → (rows, d_output)
/// ```
#[derive(Config, Debug)]
pub struct RepresentationHeadConfig {
    /// Width of the incoming token features.
    pub d_model: usize,
    /// Output width (vocabulary size for sparse heads).
    pub d_output: usize,
    /// Sparse (SPLADE max pooling) or dense (CLS pooling) output.
    #[config(default = true)]
    pub sparse: bool,
    /// Dropout probability after the GELU.
    #[config(default = 0.1)]
    pub dropout: f64,
}

/// Maps token features to one representation vector per sequence.
#[derive(Module, Debug)]
pub struct RepresentationHead<B: Backend> {
    transform: Linear<B>,
    projection: Linear<B>,
    dropout: Dropout,
    sparse: bool,
}

impl RepresentationHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RepresentationHead<B> {
        RepresentationHead {
            transform: LinearConfig::new(self.d_model, self.d_model).init(device),
            projection: LinearConfig::new(self.d_model, self.d_output).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            sparse: self.sparse,
        }
    }
}

impl<B: Backend> RepresentationHead<B> {
    /// Input: padded token features. Output: `(rows, d_output)`.
    pub fn forward(&self, input: EncodedInput<B>) -> Tensor<B, 2> {
        let x = self.transform.forward(input.features);
        let x = gelu(x);
        let x = self.dropout.forward(x);
        let logits = self.projection.forward(x);

        if self.sparse {
            splade_max(logits, input.attention_mask)
        } else {
            let [rows, _seq, d] = logits.dims();
            logits.slice([0..rows, 0..1, 0..d]).squeeze::<2>(1)
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }
}
