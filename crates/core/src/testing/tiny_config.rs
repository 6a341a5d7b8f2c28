use crate::config::{GenerationConfig, ModelConfig};

/// Create a tiny Florence-like config for testing (2 layers, 2 heads,
/// head_dim 2, vocab 16). Special ids follow Florence-2: bos 0, pad 1,
/// eos 2, decoder start 2.
pub fn tiny_florence_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        d_model: 1,
        encoder_layers: 2,
        decoder_layers: 2,
        encoder_attention_heads: 2,
        decoder_attention_heads: 2,
        head_dim: Some(2),
        bos_token_id: 0,
        pad_token_id: 1,
        eos_token_id: 2,
        decoder_start_token_id: 2,
        extra: serde_json::Map::new(),
    }
}

/// Beam search options for tiny models: `top_k == num_beams`, unit length
/// penalty and no n-gram blocking.
pub fn tiny_generation_config(num_beams: usize, max_length: usize) -> GenerationConfig {
    GenerationConfig {
        num_beams,
        max_length,
        top_k: num_beams,
        length_penalty: 1.0,
        no_repeat_ngram_size: 0,
    }
}
