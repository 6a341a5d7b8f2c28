//! Integration tests for beam search over mock encoder-decoder models.
//!
//! All CPU-only. `ScriptedModel` rebuilds each beam's history from the KV
//! cache it is handed, so a cache that drifts from its beam shows up as a
//! wrong sequence or a decode error.

use candle_core::{DType, Device, Tensor};
use vlm_core::config::{GenerationConfig, ModelConfig};
use vlm_core::engine::{
    BeamSearcher, EncoderOutput, ModelForEncoderDecoder, SearchState, VisionLanguagePipeline,
};
use vlm_core::kv_cache::LayerKeyValues;
use vlm_core::sampling::StoppingCriteria;
use vlm_core::task::Task;
use vlm_core::testing::{tiny_florence_config, tiny_generation_config, ScriptedModel};
use vlm_core::tokenizer::TokenizerWrapper;
use vlm_core::Error;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn encoder_output(src_len: usize) -> EncoderOutput {
    let hidden = Tensor::zeros((1, src_len, 1), DType::F32, &Device::Cpu).unwrap();
    EncoderOutput::unmasked(hidden).unwrap()
}

/// Vocabulary of four: bos 0, pad 1, token 2, eos 3 (also the decoder start).
fn four_token_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 4,
        eos_token_id: 3,
        decoder_start_token_id: 3,
        ..tiny_florence_config()
    }
}

fn search(
    model: &ScriptedModel,
    config: &ModelConfig,
    generation: &GenerationConfig,
) -> vlm_core::Result<Vec<u32>> {
    let mut searcher = BeamSearcher::new(config, generation)?;
    let stopping = StoppingCriteria::with_defaults(generation.max_length, config.eos_token_id);
    searcher.search(model, &encoder_output(5), &stopping)
}

fn bigrams(tokens: &[u32]) -> Vec<(u32, u32)> {
    tokens.windows(2).map(|w| (w[0], w[1])).collect()
}

// ─── Greedy and early stopping ───────────────────────────────────────────────

#[test]
fn test_single_beam_forced_eos_at_length_bound() {
    let config = four_token_config();
    let model = ScriptedModel::from_fn(4, |_| vec![0.0, 0.0, 5.0, 1.0]).unwrap();

    let tokens = search(&model, &config, &tiny_generation_config(1, 5)).unwrap();
    assert_eq!(tokens, vec![0, 2, 2, 3]);

    // Seed [3, 0] plus two cached steps.
    assert_eq!(
        model.histories(),
        vec![vec![3, 0], vec![3, 0, 2], vec![3, 0, 2, 2]]
    );
}

#[test]
fn test_single_beam_stops_on_sampled_eos() {
    let config = four_token_config();
    let model = ScriptedModel::from_fn(4, |h| {
        if h.len() < 3 {
            vec![0.0, 0.0, 5.0, 1.0]
        } else {
            vec![0.0, 0.0, 1.0, 5.0]
        }
    })
    .unwrap();

    let tokens = search(&model, &config, &tiny_generation_config(1, 20)).unwrap();
    assert_eq!(tokens, vec![0, 2, 3]);
    assert_eq!(model.decode_calls(), 2);
}

#[test]
fn test_length_penalty_prefers_longer_hypothesis() {
    // [2,0,5] finishes at once; [2,0,6] continues with 7 and finishes one
    // step later with a slightly lower total score.
    let model = ScriptedModel::from_fn(8, |h| {
        let mut row = vec![-20.0; 8];
        match h {
            [2, 0] => {
                row[5] = 1.0;
                row[6] = 0.9;
            }
            [2, 0, 6] => {
                row[7] = 5.0;
                row[3] = -5.0;
            }
            _ => {
                row[2] = 5.0;
                row[4] = -5.0;
            }
        }
        row
    })
    .unwrap();
    let config = ModelConfig {
        vocab_size: 8,
        ..tiny_florence_config()
    };

    let raw = GenerationConfig {
        length_penalty: 0.0,
        ..tiny_generation_config(2, 10)
    };
    let penalized = GenerationConfig {
        length_penalty: 5.0,
        ..tiny_generation_config(2, 10)
    };

    assert_eq!(search(&model, &config, &raw).unwrap(), vec![0, 5, 2]);
    assert_eq!(
        search(&model, &config, &penalized).unwrap(),
        vec![0, 6, 7, 2]
    );
}

// ─── Multi-beam selection ────────────────────────────────────────────────────

#[test]
fn test_three_beams_with_duplicate_parent() {
    // Seed proposes 5 > 6 > 7. Beam [2,0,5] then owns the top two
    // candidates, so one of them is forked into another slot.
    let model = ScriptedModel::from_fn(10, |h| {
        let mut row = vec![-10.0; 10];
        match h {
            [2, 0] => {
                row[5] = 3.0;
                row[6] = 2.0;
                row[7] = 1.0;
            }
            [2, 0, 5] => {
                row[8] = 5.0;
                row[9] = 4.0;
                row[4] = 0.0;
            }
            [2, 0, 6] => {
                row[8] = 1.0;
                row[9] = 0.9;
                row[4] = 0.8;
            }
            [2, 0, 7] => {
                row[4] = 20.0;
                row[8] = 0.0;
                row[9] = 0.0;
            }
            _ => row[2] = 10.0,
        }
        row
    })
    .unwrap();
    let config = ModelConfig {
        vocab_size: 10,
        ..tiny_florence_config()
    };

    let tokens = search(&model, &config, &tiny_generation_config(3, 10)).unwrap();
    assert_eq!(tokens, vec![0, 5, 8, 2]);

    // The cached step after selection saw exactly the three surviving
    // lineages, including the forked [2, 0, 5, 9].
    let mut third: Vec<Vec<u32>> = model
        .histories()
        .into_iter()
        .filter(|h| h.len() == 4)
        .collect();
    third.sort();
    assert_eq!(
        third,
        vec![vec![2, 0, 5, 8], vec![2, 0, 5, 9], vec![2, 0, 7, 4]]
    );
}

#[test]
fn test_no_repeat_bigram_never_repeats() {
    // Strong preference for low token ids, never EOS: without blocking the
    // search would emit 4 4 4 ...
    let model = ScriptedModel::from_fn(16, |_| {
        (0..16u32)
            .map(|t| if t < 4 { -100.0 } else { 16.0 - t as f32 })
            .collect()
    })
    .unwrap();
    let config = tiny_florence_config();
    let generation = GenerationConfig {
        no_repeat_ngram_size: 2,
        ..tiny_generation_config(2, 14)
    };

    let tokens = search(&model, &config, &generation).unwrap();
    assert_eq!(tokens.len(), 13);
    assert_eq!(*tokens.last().unwrap(), 2);

    let pairs = bigrams(&tokens);
    for (i, pair) in pairs.iter().enumerate() {
        assert!(
            !pairs[i + 1..].contains(pair),
            "bigram {pair:?} repeated in {tokens:?}"
        );
    }
    // Every decoded history obeys the ban as well.
    for history in model.histories() {
        let pairs = bigrams(&history);
        for (i, pair) in pairs.iter().enumerate() {
            assert!(!pairs[i + 1..].contains(pair));
        }
    }
}

// ─── Termination ─────────────────────────────────────────────────────────────

#[test]
fn test_exhausted_without_stopping_criteria() {
    let model = ScriptedModel::from_fn(8, |_| {
        let mut row = vec![0.0; 8];
        row[5] = 3.0;
        row
    })
    .unwrap();
    let config = ModelConfig {
        vocab_size: 8,
        ..tiny_florence_config()
    };
    let mut searcher = BeamSearcher::new(&config, &tiny_generation_config(2, 6)).unwrap();

    let err = searcher
        .search(&model, &encoder_output(3), &StoppingCriteria::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Exhausted {
            max_length: 6,
            finished: 0,
            required: 2
        }
    ));
    assert_eq!(searcher.state(), SearchState::Terminated);
    assert!(searcher.beams().iter().all(|b| b.len() <= 6));
}

#[test]
fn test_searcher_reused_across_encoder_lengths() {
    let config = four_token_config();
    let model = ScriptedModel::from_fn(4, |_| vec![0.0, 0.0, 5.0, 1.0]).unwrap();
    let generation = tiny_generation_config(1, 5);
    let mut searcher = BeamSearcher::new(&config, &generation).unwrap();
    let stopping = StoppingCriteria::with_defaults(generation.max_length, config.eos_token_id);

    // The mock checks that the encoder cache matches the request's source
    // length, so a stale capture fails the second request.
    let first = searcher
        .search(&model, &encoder_output(7), &stopping)
        .unwrap();
    let second = searcher
        .search(&model, &encoder_output(2), &stopping)
        .unwrap();
    assert_eq!(first, second);
}

// ─── Candle decoder through the tensor helpers ───────────────────────────────

/// Decoder that keeps its history in the KV cache as candle tensors: each
/// layer reads the past view as a tensor, appends the new token embeddings
/// and writes the result into the present view. It predicts
/// `history_len + 2` until the history reaches `eos_at` tokens.
struct TensorCacheModel {
    device: Device,
    vocab_size: usize,
    eos_id: u32,
    eos_at: usize,
}

impl ModelForEncoderDecoder for TensorCacheModel {
    fn embed_tokens(&self, token_ids: &[u32]) -> vlm_core::Result<Tensor> {
        let values: Vec<f32> = token_ids.iter().map(|&t| t as f32).collect();
        Ok(Tensor::from_vec(values, (1, token_ids.len(), 1), &self.device)?)
    }

    fn encode(&self, inputs_embeds: &Tensor, _attention_mask: &Tensor) -> vlm_core::Result<Tensor> {
        Ok(inputs_embeds.clone())
    }

    fn decode_step(
        &self,
        encoder_output: &EncoderOutput,
        inputs_embeds: &Tensor,
        past_key_values: &mut [LayerKeyValues<'_>],
        use_cache_branch: bool,
    ) -> vlm_core::Result<Tensor> {
        let tgt_len = inputs_embeds.dim(1)?;
        let mut history = Vec::new();
        for kv in past_key_values.iter_mut() {
            let shape = kv.present_decoder.key.shape();
            let new = inputs_embeds
                .reshape((1, 1, tgt_len, 1))?
                .broadcast_as((1, shape.num_heads, tgt_len, shape.head_dim))?
                .contiguous()?;
            let present = if kv.past_decoder.key.seq_len() == 0 {
                new
            } else {
                let past = kv.past_decoder.key.to_tensor(&self.device)?;
                Tensor::cat(&[&past, &new], 2)?
            };
            kv.present_decoder.key.write_tensor(&present)?;
            kv.present_decoder.value.write_tensor(&present.neg()?)?;

            if use_cache_branch {
                let cross = kv.past_encoder.key.to_tensor(&self.device)?;
                assert_eq!(cross.dims()[2], encoder_output.src_len);
            } else if let Some(encoder) = kv.present_encoder.as_mut() {
                let shape = encoder.key.shape();
                let ones = Tensor::ones(
                    (1, shape.num_heads, shape.seq_len, shape.head_dim),
                    DType::F32,
                    &self.device,
                )?;
                encoder.key.write_tensor(&ones)?;
                encoder.value.write_tensor(&ones)?;
            }

            history = present
                .get(0)?
                .get(0)?
                .narrow(1, 0, 1)?
                .flatten_all()?
                .to_vec1::<f32>()?
                .into_iter()
                .map(|v| v as u32)
                .collect();
        }

        for (pos, &token) in history.iter().enumerate().skip(2) {
            assert_eq!(token as usize, pos + 2, "history drifted: {history:?}");
        }
        let next = if history.len() >= self.eos_at {
            self.eos_id
        } else {
            history.len() as u32 + 2
        };
        let mut row = vec![0.0f32; self.vocab_size];
        row[next as usize] = 10.0;
        let row = Tensor::new(row.as_slice(), &self.device)?;
        Ok(row.unsqueeze(0)?.repeat((tgt_len, 1))?.unsqueeze(0)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[test]
fn test_candle_decoder_through_kv_tensor_helpers() {
    let config = tiny_florence_config();
    let model = TensorCacheModel {
        device: Device::Cpu,
        vocab_size: config.vocab_size,
        eos_id: config.eos_token_id,
        eos_at: 6,
    };
    let generation = tiny_generation_config(1, 12);
    let mut searcher = BeamSearcher::new(&config, &generation).unwrap();
    let stopping = StoppingCriteria::with_defaults(generation.max_length, config.eos_token_id);

    let tokens = searcher
        .search(&model, &encoder_output(4), &stopping)
        .unwrap();
    assert_eq!(tokens, vec![0, 4, 5, 6, 7, 2]);
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

#[test]
fn test_pipeline_task_with_input() {
    // t4 t5 then EOS, regardless of the prompt.
    let model = ScriptedModel::from_fn(16, |h| {
        let mut row = vec![0.0; 16];
        let next = match h.len() {
            2 => 4,
            3 => 5,
            _ => 2,
        };
        row[next] = 8.0;
        row
    })
    .unwrap();
    let mut pipeline = VisionLanguagePipeline::new(
        model,
        TokenizerWrapper::for_testing(16),
        tiny_florence_config(),
        &tiny_generation_config(2, 16),
    )
    .unwrap();
    let image = Tensor::zeros((1, 6, 1), DType::F32, &Device::Cpu).unwrap();

    let text = pipeline
        .generate(&image, Task::RegionToDescription, Some("t8 t9"))
        .unwrap();
    assert_eq!(text, "t4 t5");

    // Every decode call of the request saw the same encoder length.
    assert!(pipeline.model().decode_calls() >= 3);
    assert_eq!(pipeline.searcher().state(), SearchState::Terminated);
}
