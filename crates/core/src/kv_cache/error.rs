use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache capacity exceeded: requested {requested} positions, capacity {capacity}")]
    CapacityExceeded { requested: usize, capacity: usize },

    #[error("present length {present_len} must exceed cached length {past_len}")]
    NonAdvancingStep { past_len: usize, present_len: usize },

    #[error("encoder cache has not been captured yet")]
    EncoderNotCaptured,

    #[error("cache layout mismatch: expected {expected}, found {found}")]
    LayoutMismatch { expected: String, found: String },

    #[error("kv shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: Vec<usize>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
