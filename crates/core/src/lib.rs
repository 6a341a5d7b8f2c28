pub mod config;
pub mod engine;
pub mod error;
pub mod kv_cache;
pub mod logging;
pub mod sampling;
pub mod task;
pub mod tokenizer;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Error, Result};
