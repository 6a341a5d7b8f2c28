//! Encoder-decoder model trait for vision-language generation.
//!
//! The neural network itself is opaque to this crate: token embedding, the
//! encoder, the decoder step and top-K are operators behind
//! [`ModelForEncoderDecoder`]. The beam searcher owns the KV caches and hands
//! the decoder borrowed views for one call at a time.
//!
//! # Architecture
//!
//! 1. **Encode**: image features and prompt embeddings are concatenated and
//!    run through the encoder once per request.
//! 2. **Decode**: autoregressive steps attend to the encoder output through
//!    cross-attention. The first step runs the no-cache branch and captures
//!    the cross-attention keys/values; later steps feed one token and reuse
//!    both caches.
//!
//! # Example
//!
//! ```ignore
//! use vlm_core::engine::{merge_image_and_text, EncoderOutput, ModelForEncoderDecoder};
//!
//! let text_embeds = model.embed_tokens(&prompt_ids)?;
//! let (embeds, mask) = merge_image_and_text(&image_features, &text_embeds, &text_mask)?;
//! let hidden = model.encode(&embeds, &mask)?;
//! let encoder_output = EncoderOutput::new(hidden, mask)?;
//! let tokens = searcher.search(&model, &encoder_output, &stopping)?;
//! ```

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::kv_cache::LayerKeyValues;
use crate::sampling::{self, TopK};

/// Encoder hidden states shared by every decode step of one request.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Hidden states from the encoder `[1, src_len, d_model]`.
    pub hidden_states: Tensor,
    /// Source attention mask `[1, src_len]`, 1 = real position.
    pub attention_mask: Tensor,
    /// Source sequence length, stored separately so callers don't need to
    /// inspect tensor dimensions.
    pub src_len: usize,
}

impl EncoderOutput {
    /// Pair hidden states with their attention mask.
    pub fn new(hidden_states: Tensor, attention_mask: Tensor) -> Result<Self> {
        let (batch, src_len, _) = hidden_states.dims3()?;
        let expected = vec![1, src_len];
        if batch != 1 || attention_mask.dims() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                what: "encoder attention mask",
                expected,
                actual: attention_mask.dims().to_vec(),
            });
        }
        Ok(Self {
            hidden_states,
            attention_mask,
            src_len,
        })
    }

    /// Hidden states with every position attended.
    pub fn unmasked(hidden_states: Tensor) -> Result<Self> {
        let src_len = hidden_states.dim(1)?;
        let mask = Tensor::ones((1, src_len), DType::U32, hidden_states.device())?;
        Self::new(hidden_states, mask)
    }

    pub fn device(&self) -> &Device {
        self.hidden_states.device()
    }
}

/// Trait for encoder-decoder vision-language models (Florence-2 style).
pub trait ModelForEncoderDecoder: Send + 'static {
    /// Embed token ids into `[1, len, d_model]`.
    fn embed_tokens(&self, token_ids: &[u32]) -> Result<Tensor>;

    /// Run the encoder once per request.
    ///
    /// `inputs_embeds` is `[1, src_len, d_model]`, `attention_mask` is
    /// `[1, src_len]`. Returns hidden states `[1, src_len, d_model]`.
    fn encode(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    /// Run one decoder step. Returns logits `[1, tgt_len, vocab_size]`.
    ///
    /// `past_key_values` has one entry per decoder layer. The decoder must
    /// write the full present self-attention key/value (`past` plus the new
    /// positions) into `present_decoder`.
    ///
    /// With `use_cache_branch == false` (first step) the past views are
    /// empty and ignored, `inputs_embeds` covers the whole history, and the
    /// decoder also writes cross-attention keys/values into
    /// `present_encoder`. With `use_cache_branch == true`, `inputs_embeds`
    /// holds only the newest token and `past_encoder` holds the captured
    /// cross-attention cache.
    fn decode_step(
        &self,
        encoder_output: &EncoderOutput,
        inputs_embeds: &Tensor,
        past_key_values: &mut [LayerKeyValues<'_>],
        use_cache_branch: bool,
    ) -> Result<Tensor>;

    /// Top-K over one logits row, values descending.
    ///
    /// The default runs on the CPU; models with a device top-K operator can
    /// override it.
    fn top_k(&self, logits: &[f32], k: usize) -> Result<TopK> {
        Ok(sampling::top_k(logits, k))
    }

    /// Get the device this model is on.
    fn device(&self) -> &Device;
}

/// Concatenate image features and prompt embeddings along the sequence axis.
///
/// Returns the encoder input `[1, n_img + n_txt, d_model]` and a mask with
/// ones for every image position followed by `text_mask`.
pub fn merge_image_and_text(
    image_features: &Tensor,
    text_embeds: &Tensor,
    text_mask: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let (_, num_image, image_dim) = image_features.dims3()?;
    let (_, num_text, text_dim) = text_embeds.dims3()?;
    if image_dim != text_dim {
        return Err(Error::ShapeMismatch {
            what: "text embeddings",
            expected: vec![1, num_text, image_dim],
            actual: text_embeds.dims().to_vec(),
        });
    }
    let expected_mask = vec![1, num_text];
    if text_mask.dims() != expected_mask.as_slice() {
        return Err(Error::ShapeMismatch {
            what: "text attention mask",
            expected: expected_mask,
            actual: text_mask.dims().to_vec(),
        });
    }

    let text_embeds = text_embeds.to_dtype(image_features.dtype())?;
    let embeds = Tensor::cat(&[image_features, &text_embeds], 1)?;
    let image_mask = Tensor::ones((1, num_image), text_mask.dtype(), text_mask.device())?;
    let mask = Tensor::cat(&[&image_mask, text_mask], 1)?;
    Ok((embeds, mask))
}
