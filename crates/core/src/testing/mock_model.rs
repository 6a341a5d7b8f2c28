use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;

use crate::engine::{EncoderOutput, ModelForEncoderDecoder};
use crate::error::Result;
use crate::kv_cache::{KvView, LayerKeyValues};

/// Maps a full token history to the next-token logits row.
pub type Script = Arc<dyn Fn(&[u32]) -> Vec<f32> + Send + Sync>;

/// Offset separating the values each layer writes, so a layer mix-up shows.
const LAYER_STRIDE: f32 = 1000.0;

/// A mock model whose logits come from a script over the token history.
///
/// The decoder does not receive the history directly on cached steps: it
/// rebuilds it from the past KV views it is handed, the way a real decoder
/// only sees the past through its cache. Every layer writes
/// `token + LAYER_STRIDE * layer` as key and its negation as value for every
/// position, and checks the past it was given against the same rule. A
/// broken swap, fork or view shows up as a wrong history or an error.
pub struct ScriptedModel {
    vocab_size: usize,
    device: Device,
    embedding: Embedding,
    script: Script,
    histories: Mutex<Vec<Vec<u32>>>,
    decode_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(vocab_size: usize, script: Script) -> Result<Self> {
        let device = Device::Cpu;
        // Token t embeds to the single value t.
        let table = Tensor::arange(0u32, vocab_size as u32, &device)?
            .to_dtype(DType::F32)?
            .reshape((vocab_size, 1))?;
        Ok(Self {
            vocab_size,
            embedding: Embedding::new(table, 1),
            device,
            script,
            histories: Mutex::new(Vec::new()),
            decode_calls: AtomicUsize::new(0),
        })
    }

    /// Convenience constructor from a closure.
    pub fn from_fn<F>(vocab_size: usize, script: F) -> Result<Self>
    where
        F: Fn(&[u32]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self::new(vocab_size, Arc::new(script))
    }

    /// Histories the decoder reconstructed, one per decode call.
    pub fn histories(&self) -> Vec<Vec<u32>> {
        self.histories
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    pub fn reset_stats(&self) {
        if let Ok(mut h) = self.histories.lock() {
            h.clear();
        }
        self.decode_calls.store(0, Ordering::SeqCst);
    }

    fn check_past(layer: usize, view: &KvView<'_>, history: &[u32], sign: f32) -> Result<()> {
        let shape = view.shape();
        for head in 0..shape.num_heads {
            for (pos, &token) in history.iter().enumerate().take(shape.seq_len) {
                let expected = sign * (token as f32 + LAYER_STRIDE * layer as f32);
                for dim in 0..shape.head_dim {
                    let found = view.data()[shape.offset(head, pos, dim)];
                    if found != expected {
                        return Err(candle_core::Error::msg(format!(
                            "layer {layer} head {head} position {pos}: cached {found}, expected {expected}"
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    fn history_from_cache(layers: &[LayerKeyValues<'_>]) -> Vec<u32> {
        let Some(first) = layers.first() else {
            return Vec::new();
        };
        let view = first.past_decoder.key;
        let shape = view.shape();
        (0..shape.seq_len)
            .map(|pos| view.data()[shape.offset(0, pos, 0)] as u32)
            .collect()
    }
}

impl ModelForEncoderDecoder for ScriptedModel {
    fn embed_tokens(&self, token_ids: &[u32]) -> Result<Tensor> {
        let ids = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;
        Ok(self.embedding.forward(&ids)?)
    }

    fn encode(&self, inputs_embeds: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        Ok(inputs_embeds.clone())
    }

    fn decode_step(
        &self,
        encoder_output: &EncoderOutput,
        inputs_embeds: &Tensor,
        past_key_values: &mut [LayerKeyValues<'_>],
        use_cache_branch: bool,
    ) -> Result<Tensor> {
        let inputs: Vec<u32> = inputs_embeds
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v.round() as u32)
            .collect();

        let mut history = if use_cache_branch {
            Self::history_from_cache(past_key_values)
        } else {
            Vec::new()
        };
        history.extend_from_slice(&inputs);

        for (layer, kv) in past_key_values.iter_mut().enumerate() {
            let marker = (layer + 1) as f32;
            if use_cache_branch {
                Self::check_past(layer, &kv.past_decoder.key, &history, 1.0)?;
                Self::check_past(layer, &kv.past_decoder.value, &history, -1.0)?;
                let encoder = kv.past_encoder;
                if encoder.key.seq_len() != encoder_output.src_len
                    || encoder.key.data().iter().any(|&v| v != marker)
                    || encoder.value.data().iter().any(|&v| v != -marker)
                {
                    return Err(candle_core::Error::msg(format!(
                        "layer {layer}: encoder cache was not captured for this request"
                    ))
                    .into());
                }
            } else if let Some(present) = kv.present_encoder.as_mut() {
                present.key.data_mut().fill(marker);
                present.value.data_mut().fill(-marker);
            }

            let offset = LAYER_STRIDE * layer as f32;
            let shape = kv.present_decoder.key.shape();
            let key = kv.present_decoder.key.data_mut();
            for head in 0..shape.num_heads {
                for (pos, &token) in history.iter().enumerate().take(shape.seq_len) {
                    for dim in 0..shape.head_dim {
                        key[shape.offset(head, pos, dim)] = token as f32 + offset;
                    }
                }
            }
            let value = kv.present_decoder.value.data_mut();
            for head in 0..shape.num_heads {
                for (pos, &token) in history.iter().enumerate().take(shape.seq_len) {
                    for dim in 0..shape.head_dim {
                        value[shape.offset(head, pos, dim)] = -(token as f32 + offset);
                    }
                }
            }
        }

        let row = (self.script)(&history);
        if row.len() != self.vocab_size {
            return Err(candle_core::Error::msg(format!(
                "script returned {} logits for vocab {}",
                row.len(),
                self.vocab_size
            ))
            .into());
        }
        if let Ok(mut h) = self.histories.lock() {
            h.push(history);
        }
        self.decode_calls.fetch_add(1, Ordering::SeqCst);

        // Only the last row is meaningful; earlier rows are zeros.
        let tgt_len = inputs.len();
        let mut logits = vec![0.0f32; tgt_len * self.vocab_size];
        logits[(tgt_len - 1) * self.vocab_size..].copy_from_slice(&row);
        Ok(Tensor::from_vec(
            logits,
            (1, tgt_len, self.vocab_size),
            &self.device,
        )?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
