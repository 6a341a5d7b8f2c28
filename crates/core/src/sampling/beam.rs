//! Beam state and finished-hypothesis bookkeeping.
//!
//! A beam owns a fixed-capacity token buffer, its cumulative log-probability
//! and a private decoder KV cache. Beams are allocated once per searcher and
//! rewritten in place: `append` extends a lineage, `fork_from` replaces it
//! with a copy of another beam's.

use crate::error::Result;
use crate::kv_cache::{CacheConfig, CacheError, DecoderKVCache};

/// One expansion candidate produced by the sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleResult {
    pub token_id: u32,
    /// Cumulative score of the parent beam plus this token's log-probability.
    pub score: f64,
    /// Slot index of the beam that produced this candidate.
    pub parent: usize,
}

#[derive(Debug, Clone)]
pub struct Beam {
    tokens: Box<[u32]>,
    len: usize,
    score: f64,
    cache: DecoderKVCache,
    active: bool,
}

impl Beam {
    /// Allocate a beam whose history may hold up to `cache_config.max_seq_len`
    /// tokens.
    pub fn new(cache_config: CacheConfig) -> Self {
        Self {
            tokens: vec![0; cache_config.max_seq_len].into_boxed_slice(),
            len: 0,
            score: 0.0,
            cache: DecoderKVCache::new(cache_config),
            active: false,
        }
    }

    /// Start a fresh lineage from `seed`.
    pub fn reset(&mut self, seed: &[u32]) -> Result<()> {
        if seed.len() > self.tokens.len() {
            return Err(self.capacity_error(seed.len()).into());
        }
        self.tokens[..seed.len()].copy_from_slice(seed);
        self.len = seed.len();
        self.score = 0.0;
        self.cache.reset();
        self.active = true;
        Ok(())
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.tokens[..self.len]
    }

    pub fn last_token(&self) -> Option<u32> {
        self.token_ids().last().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn cache(&self) -> &DecoderKVCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut DecoderKVCache {
        &mut self.cache
    }

    /// Extend this beam's own lineage with `result`.
    ///
    /// The KV cache is left alone: it was advanced when this beam was sampled.
    pub fn append(&mut self, result: &SampleResult) -> Result<()> {
        if self.len == self.tokens.len() {
            return Err(self.capacity_error(self.len + 1).into());
        }
        self.tokens[self.len] = result.token_id;
        self.len += 1;
        self.score = result.score;
        Ok(())
    }

    /// Replace this beam's lineage with `source`'s first `prefix_len` tokens
    /// followed by `result.token_id`, deep-copying the source's KV cache.
    ///
    /// `prefix_len` is given explicitly because `source` may already have
    /// been extended in place during the same selection round.
    pub fn fork_from(
        &mut self,
        source: &Beam,
        result: &SampleResult,
        prefix_len: usize,
    ) -> Result<()> {
        if prefix_len >= self.tokens.len() || prefix_len > source.len {
            return Err(self.capacity_error(prefix_len + 1).into());
        }
        self.tokens[..prefix_len].copy_from_slice(&source.tokens[..prefix_len]);
        self.tokens[prefix_len] = result.token_id;
        self.len = prefix_len + 1;
        self.score = result.score;
        self.cache.fork_from(&source.cache)?;
        self.active = true;
        Ok(())
    }

    fn capacity_error(&self, requested: usize) -> CacheError {
        CacheError::CapacityExceeded {
            requested,
            capacity: self.tokens.len(),
        }
    }
}

/// A finished sequence with its length-normalized score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub token_ids: Vec<u32>,
    /// Cumulative log-probability.
    pub score: f64,
    /// `score / len^length_penalty`
    pub final_score: f64,
}

/// Finished hypotheses of one search, at most `num_beams`.
#[derive(Debug, Clone)]
pub struct HypothesisCollection {
    hypotheses: Vec<Hypothesis>,
    num_beams: usize,
    length_penalty: f64,
}

impl HypothesisCollection {
    pub fn new(num_beams: usize, length_penalty: f64) -> Self {
        Self {
            hypotheses: Vec::with_capacity(num_beams),
            num_beams,
            length_penalty,
        }
    }

    /// Record a finished sequence. Ignored once the collection is full.
    pub fn add(&mut self, token_ids: &[u32], score: f64) {
        if self.is_full() {
            return;
        }
        let length = token_ids.len().max(1) as f64;
        let final_score = score / length.powf(self.length_penalty);
        self.hypotheses.push(Hypothesis {
            token_ids: token_ids.to_vec(),
            score,
            final_score,
        });
    }

    pub fn is_full(&self) -> bool {
        self.hypotheses.len() >= self.num_beams
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hypothesis> {
        self.hypotheses.iter()
    }

    /// Largest `final_score`; the earliest added wins ties.
    pub fn best(&self) -> Option<&Hypothesis> {
        self.hypotheses.iter().fold(None, |best, h| match best {
            Some(b) if b.final_score >= h.final_score => Some(b),
            _ => Some(h),
        })
    }

    pub fn clear(&mut self) {
        self.hypotheses.clear();
    }
}
