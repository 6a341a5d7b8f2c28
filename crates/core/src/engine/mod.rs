//! Decoding engine for encoder-decoder vision-language models.
//!
//! # Architecture
//!
//! - [`ModelForEncoderDecoder`] is the seam to the neural network: embed,
//!   encode, one decoder step, top-K.
//! - [`BeamSearcher`] owns the beams, their decoder KV caches and the shared
//!   encoder KV cache, and drives the step loop.
//! - [`VisionLanguagePipeline`] wires a model and tokenizer to a searcher for
//!   one image and one task at a time.
//!
//! # Example
//!
//! ```ignore
//! let mut pipeline = VisionLanguagePipeline::new(model, tokenizer, config, &generation)?;
//! let caption = pipeline.generate(&image_features, Task::Caption, None)?;
//! ```

mod beam_search;
mod encoder_decoder;
pub mod pipeline;

pub use beam_search::{BeamSearcher, SearchState};
pub use encoder_decoder::{merge_image_and_text, EncoderOutput, ModelForEncoderDecoder};
pub use pipeline::VisionLanguagePipeline;
