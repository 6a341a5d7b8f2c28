//! Logits processors applied to the last logits row before top-K.
//!
//! Each processor receives the full token history of the beam being sampled
//! (decoder-start token included). Processors run in the order they were
//! pushed; the generation pipeline uses: no-repeat-n-gram, forced BOS,
//! forced EOS.

use ahash::AHashMap;

use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{Error, Result};

/// Trait for logit transformations applied before top-K selection.
///
/// Implementors modify the logits slice in place. The slice has length
/// `vocab_size` and contains raw (unnormalized) scores.
pub trait LogitsProcessor: Send + Sync {
    /// Apply this processor's transformation to the logit vector.
    ///
    /// Fails only when a token id the processor needs to touch lies outside
    /// `logits`; that is a model/config mismatch, not a recoverable state.
    fn process(&self, logits: &mut [f32], token_ids: &[u32]) -> Result<()>;

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;
}

fn slot(logits: &mut [f32], token_id: u32) -> Result<&mut f32> {
    let vocab_size = logits.len();
    logits
        .get_mut(token_id as usize)
        .ok_or(Error::TokenOutOfVocab {
            token_id,
            vocab_size,
        })
}

/// Set every logit to `-inf` except `token_id`, which becomes 0.
fn force_token(logits: &mut [f32], token_id: u32) -> Result<()> {
    // Validate before touching the row.
    slot(logits, token_id)?;
    logits.fill(f32::NEG_INFINITY);
    *slot(logits, token_id)? = 0.0;
    Ok(())
}

/// Bans any token that would complete an n-gram already present in the
/// history.
///
/// For a history of length `L`, every window of `n` tokens records its
/// `n - 1` token prefix and the token that followed. The trailing `n - 1`
/// tokens are looked up and all recorded followers get `-inf`. Nothing is
/// banned while `L + 1 < n`; `n == 0` disables the processor.
///
/// The map is rebuilt on every call; histories are short.
pub struct NoRepeatNGramProcessor {
    ngram_size: usize,
}

impl NoRepeatNGramProcessor {
    pub fn new(ngram_size: usize) -> Self {
        Self { ngram_size }
    }

    /// Tokens that may not follow `token_ids`, in first-seen order.
    pub fn banned_tokens(&self, token_ids: &[u32]) -> Vec<u32> {
        let n = self.ngram_size;
        if n == 0 || token_ids.len() + 1 < n {
            return Vec::new();
        }

        let mut followers: AHashMap<&[u32], Vec<u32>> = AHashMap::new();
        for window in token_ids.windows(n) {
            followers
                .entry(&window[..n - 1])
                .or_default()
                .push(window[n - 1]);
        }

        let suffix = &token_ids[token_ids.len() + 1 - n..];
        followers.remove(suffix).unwrap_or_default()
    }
}

impl LogitsProcessor for NoRepeatNGramProcessor {
    fn process(&self, logits: &mut [f32], token_ids: &[u32]) -> Result<()> {
        for token_id in self.banned_tokens(token_ids) {
            *slot(logits, token_id)? = f32::NEG_INFINITY;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "no_repeat_ngram"
    }
}

/// Forces BOS as the first generated token, i.e. when the history holds only
/// the decoder-start token.
pub struct ForcedBosTokenProcessor {
    bos_token_id: u32,
}

impl ForcedBosTokenProcessor {
    pub fn new(bos_token_id: u32) -> Self {
        Self { bos_token_id }
    }
}

impl LogitsProcessor for ForcedBosTokenProcessor {
    fn process(&self, logits: &mut [f32], token_ids: &[u32]) -> Result<()> {
        if token_ids.len() == 1 {
            force_token(logits, self.bos_token_id)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "forced_bos"
    }
}

/// Forces EOS as the token that fills the last history slot.
pub struct ForcedEosTokenProcessor {
    max_length: usize,
    eos_token_id: u32,
}

impl ForcedEosTokenProcessor {
    pub fn new(max_length: usize, eos_token_id: u32) -> Self {
        Self {
            max_length,
            eos_token_id,
        }
    }
}

impl LogitsProcessor for ForcedEosTokenProcessor {
    fn process(&self, logits: &mut [f32], token_ids: &[u32]) -> Result<()> {
        if token_ids.len() + 1 == self.max_length {
            force_token(logits, self.eos_token_id)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "forced_eos"
    }
}

/// Pipeline of logits processors applied in sequence.
pub struct LogitsProcessorPipeline {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorPipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// Add a processor to the end of the pipeline.
    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    /// Apply all processors in order, stopping at the first failure.
    pub fn process(&self, logits: &mut [f32], token_ids: &[u32]) -> Result<()> {
        for processor in &self.processors {
            processor.process(logits, token_ids)?;
        }
        Ok(())
    }

    /// Returns true if the pipeline has no processors.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Number of processors in the pipeline.
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Build the standard beam search pipeline.
    ///
    /// Special token ids are checked against the vocabulary here so a bad
    /// config fails before the first decode call.
    pub fn for_generation(generation: &GenerationConfig, model: &ModelConfig) -> Result<Self> {
        model.check_token(model.bos_token_id)?;
        model.check_token(model.eos_token_id)?;

        let mut pipeline = Self::new();
        if generation.no_repeat_ngram_size > 0 {
            pipeline.push(Box::new(NoRepeatNGramProcessor::new(
                generation.no_repeat_ngram_size,
            )));
        }
        pipeline.push(Box::new(ForcedBosTokenProcessor::new(model.bos_token_id)));
        pipeline.push(Box::new(ForcedEosTokenProcessor::new(
            generation.max_length,
            model.eos_token_id,
        )));
        Ok(pipeline)
    }
}

impl Default for LogitsProcessorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_repeat_bans_completing_token() {
        let proc = NoRepeatNGramProcessor::new(3);
        let mut logits = vec![1.0; 10];
        // "5 6 7 ... 5 6" → 7 would repeat the trigram 5 6 7
        proc.process(&mut logits, &[2, 0, 5, 6, 7, 8, 5, 6]).unwrap();

        assert!(logits[7] == f32::NEG_INFINITY);
        assert_eq!(logits.iter().filter(|l| l.is_infinite()).count(), 1);
    }

    #[test]
    fn test_no_repeat_collects_all_followers() {
        let proc = NoRepeatNGramProcessor::new(2);
        // 4 was followed by 5 and by 6
        assert_eq!(proc.banned_tokens(&[4, 5, 4, 6, 4]), vec![5, 6]);
    }

    #[test]
    fn test_no_repeat_short_history_is_noop() {
        let proc = NoRepeatNGramProcessor::new(3);
        let mut logits = vec![1.0; 4];
        proc.process(&mut logits, &[1]).unwrap();
        assert!(logits.iter().all(|&l| l == 1.0));

        // L + 1 == n: windows are empty, nothing to ban
        proc.process(&mut logits, &[1, 1]).unwrap();
        assert!(logits.iter().all(|&l| l == 1.0));
    }

    #[test]
    fn test_no_repeat_size_one_bans_every_seen_token() {
        let proc = NoRepeatNGramProcessor::new(1);
        assert_eq!(proc.banned_tokens(&[3, 1, 3]), vec![3, 1, 3]);
    }

    #[test]
    fn test_no_repeat_disabled_at_zero() {
        let proc = NoRepeatNGramProcessor::new(0);
        assert!(proc.banned_tokens(&[1, 1, 1, 1]).is_empty());
    }

    #[test]
    fn test_no_repeat_out_of_vocab_is_error() {
        let proc = NoRepeatNGramProcessor::new(2);
        let mut logits = vec![0.0; 4];
        let err = proc.process(&mut logits, &[1, 9, 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::TokenOutOfVocab {
                token_id: 9,
                vocab_size: 4
            }
        ));
    }

    #[test]
    fn test_forced_bos_only_on_first_step() {
        let proc = ForcedBosTokenProcessor::new(0);

        let mut logits = vec![3.0, 4.0, 5.0];
        proc.process(&mut logits, &[2]).unwrap();
        assert_eq!(logits[0], 0.0);
        assert!(logits[1] == f32::NEG_INFINITY);
        assert!(logits[2] == f32::NEG_INFINITY);

        let mut logits = vec![3.0, 4.0, 5.0];
        proc.process(&mut logits, &[2, 0]).unwrap();
        assert_eq!(logits, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_forced_eos_at_last_slot() {
        let proc = ForcedEosTokenProcessor::new(5, 2);

        let mut logits = vec![1.0; 4];
        proc.process(&mut logits, &[2, 0, 1]).unwrap();
        assert!(logits.iter().all(|&l| l == 1.0));

        proc.process(&mut logits, &[2, 0, 1, 1]).unwrap();
        assert_eq!(logits[2], 0.0);
        assert_eq!(logits.iter().filter(|l| l.is_infinite()).count(), 3);
    }

    #[test]
    fn test_forced_token_out_of_vocab_leaves_logits_untouched() {
        let proc = ForcedBosTokenProcessor::new(7);
        let mut logits = vec![1.0, 2.0];
        assert!(proc.process(&mut logits, &[2]).is_err());
        assert_eq!(logits, vec![1.0, 2.0]);
    }

    #[test]
    fn test_pipeline_for_generation_order() {
        let pipeline = LogitsProcessorPipeline::for_generation(
            &GenerationConfig::default(),
            &ModelConfig::default(),
        )
        .unwrap();
        assert_eq!(
            pipeline.names(),
            vec!["no_repeat_ngram", "forced_bos", "forced_eos"]
        );
    }

    #[test]
    fn test_pipeline_without_ngram_blocking() {
        let generation = GenerationConfig {
            no_repeat_ngram_size: 0,
            ..GenerationConfig::default()
        };
        let pipeline =
            LogitsProcessorPipeline::for_generation(&generation, &ModelConfig::default()).unwrap();
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_pipeline_rejects_bad_special_tokens() {
        let model = ModelConfig {
            eos_token_id: 60000,
            ..ModelConfig::default()
        };
        let result = LogitsProcessorPipeline::for_generation(&GenerationConfig::default(), &model);
        assert!(matches!(result, Err(Error::TokenOutOfVocab { .. })));
    }

    #[test]
    fn test_pipeline_forced_eos_wins_over_ngram() {
        let generation = GenerationConfig {
            max_length: 5,
            no_repeat_ngram_size: 2,
            ..GenerationConfig::default()
        };
        let model = ModelConfig {
            vocab_size: 4,
            ..ModelConfig::default()
        };
        let pipeline = LogitsProcessorPipeline::for_generation(&generation, &model).unwrap();

        let mut logits = vec![1.0; 4];
        pipeline.process(&mut logits, &[2, 0, 3, 1]).unwrap();
        assert_eq!(logits[2], 0.0);
        assert!(!pipeline.is_empty());
    }
}
