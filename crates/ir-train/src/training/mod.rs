//! Training objectives, their loss and regularization terms, metric
//! accumulation, checkpoint persistence, and the training-loop driver.

pub mod checkpoint;
pub mod data;
pub mod dual;
pub mod loss;
pub mod metrics;
pub mod objective;
pub mod regularization;
pub mod reranker;
pub mod trainer;
