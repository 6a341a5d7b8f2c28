//! Crate-level error type.
//!
//! Configuration and vocabulary errors are raised at construction time.
//! Failures coming out of the model operators are propagated unchanged: a
//! decode step is not resumable, so nothing in this crate retries.

use thiserror::Error;

use crate::kv_cache::CacheError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("token id {token_id} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfVocab { token_id: u32, vocab_size: usize },

    #[error(
        "search exhausted at length {max_length} with {finished} of {required} hypotheses finished"
    )]
    Exhausted {
        max_length: usize,
        finished: usize,
        required: usize,
    },

    #[error("unexpected {what} shape: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("task {task} requires a text input")]
    MissingTaskInput { task: &'static str },

    #[error("unknown task token: {0}")]
    UnknownTask(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Errors that indicate a model/configuration mismatch rather than a
    /// failure of a single request.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::TokenOutOfVocab { .. } | Self::Json(_)
        )
    }
}
