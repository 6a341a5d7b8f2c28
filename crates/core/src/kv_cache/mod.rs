//! Incremental key/value caches for encoder-decoder generation.
//!
//! Each beam owns a [`DecoderKVCache`] with a past/present double buffer per
//! layer. The cross-attention cache ([`EncoderKVCache`]) is shared by all
//! beams of a search and captured once.

pub mod config;
mod decoder;
mod encoder;
mod error;
mod view;

pub use config::CacheConfig;
pub use decoder::DecoderKVCache;
pub use encoder::{EncoderCacheMode, EncoderKVCache};
pub use error::CacheError;
pub use view::{KeyValue, KeyValueMut, KvShape, KvView, KvViewMut, LayerKeyValues};
