//! Training objectives for neural retrieval models.
//!
//! Provides the loss and regularization logic for SPLADE-style sparse
//! encoders, dense dual encoders, and cross-encoder rerankers trained with
//! in-batch contrastive loss plus knowledge distillation from teacher scores.
//! Objectives are strategy objects plugged into a generic training-loop
//! driver ([`training::trainer::train`]).

pub mod error;
pub mod model;
pub mod training;

pub use error::{Result, TrainError};
