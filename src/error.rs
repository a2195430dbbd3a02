use thiserror::Error;

/// Errors surfaced by training and detection.
///
/// `InvalidInput` and `EmptyTrainingSet` are fatal. `InsufficientFeatures`
/// fails a single template: training logs it and continues as long as at
/// least one template survives. `NumericDegenerate` on a scene window drops
/// that window without surfacing here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("template {id}: {kind} pool has {have} usable pixels, need more than {need}")]
    InsufficientFeatures {
        id: u32,
        kind: &'static str,
        have: usize,
        need: usize,
    },

    #[error("no templates supplied for training")]
    EmptyTrainingSet,

    #[error("cancelled")]
    Cancelled,

    #[error("degenerate depth data: {0}")]
    NumericDegenerate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
