//! One decode step for one beam.

use candle_core::DType;
use tracing::trace;

use super::beam::{Beam, SampleResult};
use super::logits_processor::LogitsProcessorPipeline;
use crate::config::{GenerationConfig, ModelConfig};
use crate::engine::{EncoderOutput, ModelForEncoderDecoder};
use crate::error::{Error, Result};
use crate::kv_cache::{CacheError, EncoderCacheMode, LayerKeyValues};

/// Turns a beam into `num_candidates` scored continuations.
///
/// Per call: embed → decode (writing the beam's present KV, then swapping
/// it into the past) → last logits row → processors → top-K →
/// log-softmax over the top-K values.
pub struct Sampler {
    processors: LogitsProcessorPipeline,
    num_candidates: usize,
    top_k: usize,
    vocab_size: usize,
}

impl Sampler {
    pub fn new(
        processors: LogitsProcessorPipeline,
        num_candidates: usize,
        top_k: usize,
        vocab_size: usize,
    ) -> Self {
        Self {
            processors,
            num_candidates,
            top_k,
            vocab_size,
        }
    }

    pub fn from_config(generation: &GenerationConfig, model: &ModelConfig) -> Result<Self> {
        let processors = LogitsProcessorPipeline::for_generation(generation, model)?;
        Ok(Self::new(
            processors,
            generation.num_beams,
            generation.top_k,
            model.vocab_size,
        ))
    }

    pub fn num_candidates(&self) -> usize {
        self.num_candidates
    }

    /// Sample `beam`, pushing its candidates onto `out` with parent
    /// `beam_index`.
    ///
    /// In capture mode the whole history is fed through the no-cache branch
    /// and the encoder cache is filled; the beam's decoder cache must be
    /// empty. In reuse mode only the last token is fed.
    pub fn sample<M: ModelForEncoderDecoder + ?Sized>(
        &self,
        model: &M,
        beam: &mut Beam,
        beam_index: usize,
        encoder_output: &EncoderOutput,
        encoder_cache: EncoderCacheMode<'_>,
        out: &mut Vec<SampleResult>,
    ) -> Result<()> {
        let use_cache_branch = !encoder_cache.is_capture();
        let history_len = beam.len();
        if history_len == 0 {
            return Err(Error::invalid_config("cannot sample an empty beam"));
        }
        let input_len = if use_cache_branch { 1 } else { history_len };
        let inputs_embeds = model.embed_tokens(&beam.token_ids()[history_len - input_len..])?;

        let logits = {
            let decoder_views = beam.cache_mut().layer_views(history_len)?;
            let num_layers = decoder_views.len();
            let mut layers: Vec<LayerKeyValues<'_>> = match encoder_cache {
                EncoderCacheMode::Capture(cache) => {
                    check_layers(num_layers, cache.num_layers())?;
                    decoder_views
                        .into_iter()
                        .zip(cache.begin_capture(encoder_output.src_len))
                        .map(|((past_decoder, present_decoder), (past_encoder, present_encoder))| {
                            LayerKeyValues {
                                past_decoder,
                                present_decoder,
                                past_encoder,
                                present_encoder: Some(present_encoder),
                            }
                        })
                        .collect()
                }
                EncoderCacheMode::Reuse(cache) => {
                    let encoder_views = cache.views()?;
                    check_layers(num_layers, encoder_views.len())?;
                    decoder_views
                        .into_iter()
                        .zip(encoder_views)
                        .map(|((past_decoder, present_decoder), past_encoder)| LayerKeyValues {
                            past_decoder,
                            present_decoder,
                            past_encoder,
                            present_encoder: None,
                        })
                        .collect()
                }
            };
            model.decode_step(encoder_output, &inputs_embeds, &mut layers, use_cache_branch)?
        };
        beam.cache_mut().advance(history_len)?;

        let (batch, tgt_len, vocab) = logits.dims3()?;
        if batch != 1 || tgt_len != input_len || vocab != self.vocab_size {
            return Err(Error::ShapeMismatch {
                what: "decoder logits",
                expected: vec![1, input_len, self.vocab_size],
                actual: logits.dims().to_vec(),
            });
        }
        // The no-cache branch returns one row per input token; only the last
        // one predicts the next token.
        let mut row = logits
            .get(0)?
            .get(tgt_len - 1)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;

        self.processors.process(&mut row, beam.token_ids())?;

        let top = model.top_k(&row, self.top_k)?;
        if top.len() < self.num_candidates || top.indices.len() != top.values.len() {
            return Err(Error::ShapeMismatch {
                what: "top-k output",
                expected: vec![self.top_k],
                actual: vec![top.values.len(), top.indices.len()],
            });
        }
        let log_probs = super::log_softmax(&top.values);

        let base = beam.score();
        for (&token_id, &log_prob) in top
            .indices
            .iter()
            .zip(&log_probs)
            .take(self.num_candidates)
        {
            out.push(SampleResult {
                token_id,
                score: base + log_prob,
                parent: beam_index,
            });
        }

        trace!(
            beam = beam_index,
            history_len,
            best_token = ?top.indices.first(),
            best_log_prob = ?log_probs.first(),
            "sampled beam"
        );
        Ok(())
    }
}

fn check_layers(decoder: usize, encoder: usize) -> Result<()> {
    if decoder != encoder {
        return Err(CacheError::LayoutMismatch {
            expected: format!("{decoder} encoder cache layers"),
            found: format!("{encoder} encoder cache layers"),
        }
        .into());
    }
    Ok(())
}
