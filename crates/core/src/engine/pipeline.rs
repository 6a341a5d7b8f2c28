//! End-to-end generation for one image and one task.
//!
//! ```text
//! task prompt → tokenize → embed → [image features | text] → encode (once)
//!   → beam search → detokenize
//! ```

use candle_core::Tensor;
use tracing::debug;

use super::beam_search::BeamSearcher;
use super::encoder_decoder::{merge_image_and_text, EncoderOutput, ModelForEncoderDecoder};
use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{Error, Result};
use crate::sampling::StoppingCriteria;
use crate::task::Task;
use crate::tokenizer::TokenizerWrapper;

/// Owns a model, its tokenizer and a reusable searcher.
///
/// Requests run one at a time; the searcher's buffers are reused between
/// them.
pub struct VisionLanguagePipeline<M: ModelForEncoderDecoder> {
    model: M,
    tokenizer: TokenizerWrapper,
    config: ModelConfig,
    searcher: BeamSearcher,
    stopping: StoppingCriteria,
}

impl<M: ModelForEncoderDecoder> VisionLanguagePipeline<M> {
    pub fn new(
        model: M,
        tokenizer: TokenizerWrapper,
        config: ModelConfig,
        generation: &GenerationConfig,
    ) -> Result<Self> {
        let specials = tokenizer.special_tokens()?;
        for (name, tokenizer_id, config_id) in [
            ("bos", specials.bos, config.bos_token_id),
            ("pad", specials.pad, config.pad_token_id),
            ("eos", specials.eos, config.eos_token_id),
        ] {
            if tokenizer_id != config_id {
                return Err(Error::invalid_config(format!(
                    "tokenizer {name} id {tokenizer_id} does not match model config id {config_id}"
                )));
            }
        }

        let searcher = BeamSearcher::new(&config, generation)?;
        let stopping = StoppingCriteria::with_defaults(generation.max_length, config.eos_token_id);
        Ok(Self {
            model,
            tokenizer,
            config,
            searcher,
            stopping,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &TokenizerWrapper {
        &self.tokenizer
    }

    pub fn searcher(&self) -> &BeamSearcher {
        &self.searcher
    }

    /// Replace the stopping criteria used by later requests.
    pub fn set_stopping(&mut self, stopping: StoppingCriteria) {
        self.stopping = stopping;
    }

    /// Run the encoder for `image_features` `[1, n_img, d_model]` and the
    /// task prompt.
    pub fn encode(
        &self,
        image_features: &Tensor,
        task: Task,
        input: Option<&str>,
    ) -> Result<EncoderOutput> {
        let prompt = task.prompt(input)?;
        let encoded = self.tokenizer.encode_prompt(&prompt)?;
        for &id in &encoded.ids {
            self.config.check_token(id)?;
        }

        let device = self.model.device();
        let text_embeds = self.model.embed_tokens(&encoded.ids)?;
        let text_mask = Tensor::new(encoded.attention_mask.as_slice(), device)?.unsqueeze(0)?;
        let image_features = image_features.to_device(device)?;
        let (inputs_embeds, attention_mask) =
            merge_image_and_text(&image_features, &text_embeds, &text_mask)?;
        let hidden_states = self.model.encode(&inputs_embeds, &attention_mask)?;
        debug!(
            %task,
            prompt_tokens = encoded.ids.len(),
            src_len = attention_mask.dim(1)?,
            "encoded request"
        );
        EncoderOutput::new(hidden_states, attention_mask)
    }

    /// Generate token ids for one request (BOS first, EOS last when the
    /// search finished on EOS).
    pub fn generate_tokens(
        &mut self,
        image_features: &Tensor,
        task: Task,
        input: Option<&str>,
    ) -> Result<Vec<u32>> {
        let encoder_output = self.encode(image_features, task, input)?;
        self.searcher
            .search(&self.model, &encoder_output, &self.stopping)
    }

    /// Generate and detokenize, dropping special tokens.
    pub fn generate(
        &mut self,
        image_features: &Tensor,
        task: Task,
        input: Option<&str>,
    ) -> Result<String> {
        let tokens = self.generate_tokens(image_features, task, input)?;
        self.tokenizer.decode(&tokens)
    }
}
