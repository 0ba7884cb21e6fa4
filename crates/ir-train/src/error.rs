use std::path::PathBuf;

/// Errors raised by objectives, data loading, and checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// A distillation objective was given a batch without teacher scores.
    #[error("batch has no teacher scores; distillation objectives require a `scores` field")]
    MissingTeacherScores,

    /// Teacher scores do not line up with the student's candidate grid.
    #[error("teacher scores have {actual} values, expected {expected} (batch x candidates)")]
    ScoreCountMismatch { expected: usize, actual: usize },

    /// A query group or batch does not have the expected shape.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A line of the training data could not be used.
    #[error("{path}:{line}: {message}")]
    Data {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// The model's pooling does not match what the objective expects.
    #[error("model does not fit the objective: {0}")]
    ModelMismatch(String),

    /// A weights file required for restore is absent.
    #[error("checkpoint weights not found at {0}")]
    MissingWeights(PathBuf),

    /// burn record (de)serialization failed.
    #[error("record error at {path}: {message}")]
    Record { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
