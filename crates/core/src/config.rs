use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Model constants read from a HF-style `config.json`.
///
/// Only the fields the decoder loop needs are typed; everything else is kept
/// in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub bos_token_id: u32,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub decoder_start_token_id: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    /// Florence-2-large language model.
    fn default() -> Self {
        Self {
            vocab_size: 51289,
            d_model: 1024,
            encoder_layers: 12,
            decoder_layers: 12,
            encoder_attention_heads: 16,
            decoder_attention_heads: 16,
            head_dim: None,
            bos_token_id: 0,
            pad_token_id: 1,
            eos_token_id: 2,
            decoder_start_token_id: 2,
            extra: serde_json::Map::new(),
        }
    }
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Per-head dimension: explicit `head_dim`, else `d_model / heads`.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.d_model / self.decoder_attention_heads.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder_layers != self.decoder_layers {
            return Err(Error::invalid_config(format!(
                "encoder_layers ({}) must equal decoder_layers ({})",
                self.encoder_layers, self.decoder_layers
            )));
        }
        if self.encoder_attention_heads != self.decoder_attention_heads {
            return Err(Error::invalid_config(format!(
                "encoder_attention_heads ({}) must equal decoder_attention_heads ({})",
                self.encoder_attention_heads, self.decoder_attention_heads
            )));
        }
        if self.decoder_layers == 0 || self.decoder_attention_heads == 0 || self.head_dim() == 0 {
            return Err(Error::invalid_config(
                "layers, attention heads and head_dim must be non-zero",
            ));
        }
        if self.vocab_size == 0 {
            return Err(Error::invalid_config("vocab_size must be non-zero"));
        }
        for token_id in [
            self.bos_token_id,
            self.pad_token_id,
            self.eos_token_id,
            self.decoder_start_token_id,
        ] {
            self.check_token(token_id)?;
        }
        Ok(())
    }

    pub fn check_token(&self, token_id: u32) -> Result<()> {
        if token_id as usize >= self.vocab_size {
            return Err(Error::TokenOutOfVocab {
                token_id,
                vocab_size: self.vocab_size,
            });
        }
        Ok(())
    }
}

/// Beam search options, as found in `generation_config.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    /// Maximum history length, decoder-start token included.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
    /// 0 disables n-gram blocking.
    #[serde(default = "default_no_repeat_ngram_size")]
    pub no_repeat_ngram_size: usize,
}

fn default_num_beams() -> usize {
    3
}

fn default_max_length() -> usize {
    1025
}

fn default_top_k() -> usize {
    50
}

fn default_length_penalty() -> f64 {
    1.0
}

fn default_no_repeat_ngram_size() -> usize {
    3
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_beams: default_num_beams(),
            max_length: default_max_length(),
            top_k: default_top_k(),
            length_penalty: default_length_penalty(),
            no_repeat_ngram_size: default_no_repeat_ngram_size(),
        }
    }
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Check the options against each other and against the model.
    pub fn validate(&self, model: &ModelConfig) -> Result<()> {
        if self.num_beams == 0 {
            return Err(Error::invalid_config("num_beams must be at least 1"));
        }
        if self.top_k < self.num_beams {
            return Err(Error::invalid_config(format!(
                "top_k ({}) must be at least num_beams ({})",
                self.top_k, self.num_beams
            )));
        }
        if self.top_k > model.vocab_size {
            return Err(Error::invalid_config(format!(
                "top_k ({}) exceeds vocab_size ({})",
                self.top_k, model.vocab_size
            )));
        }
        // Two seed tokens plus at least one generated token.
        if self.max_length < 3 {
            return Err(Error::invalid_config(format!(
                "max_length ({}) must be at least 3",
                self.max_length
            )));
        }
        if !self.length_penalty.is_finite() {
            return Err(Error::invalid_config("length_penalty must be finite"));
        }
        Ok(())
    }
}
