use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

use crate::model::bridge::EncodedInput;
use crate::model::CrossEncoderModel;

/// Configuration for a [`CrossEncoder`] scoring head.
///
/// ```text
/// (rows, seq, d_model)  joint query ++ candidate tokens
///   → masked mean over seq
///   → Linear(d_model→d_hidden) → SiLU → Dropout
///   → Linear(d_hidden→num_labels)
///   → logits: (rows, num_labels)
/// ```
#[derive(Config, Debug)]
pub struct CrossEncoderConfig {
    pub d_model: usize,
    #[config(default = 256)]
    pub d_hidden: usize,
    /// Number of output logits; column 0 is used as the relevance score.
    #[config(default = 1)]
    pub num_labels: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

#[derive(Module, Debug)]
pub struct CrossEncoder<B: Backend> {
    hidden: Linear<B>,
    classifier: Linear<B>,
    dropout: Dropout,
}

impl CrossEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CrossEncoder<B> {
        CrossEncoder {
            hidden: LinearConfig::new(self.d_model, self.d_hidden).init(device),
            classifier: LinearConfig::new(self.d_hidden, self.num_labels).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> CrossEncoder<B> {
    pub fn forward(&self, pairs: EncodedInput<B>) -> Tensor<B, 2> {
        let mask = pairs.attention_mask;
        let lengths = mask.clone().sum_dim(1).clamp_min(1.0); // (rows, 1)
        let summed = (pairs.features * mask.unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .squeeze::<2>(1); // (rows, d_model)
        let pooled = summed / lengths;

        let x = self.hidden.forward(pooled);
        let x = silu(x);
        let x = self.dropout.forward(x);
        self.classifier.forward(x)
    }
}

impl<B: Backend> CrossEncoderModel<B> for CrossEncoder<B> {
    fn relevance_logits(&self, pairs: EncodedInput<B>) -> Tensor<B, 2> {
        self.forward(pairs)
    }
}
