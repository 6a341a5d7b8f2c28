//! Beam search over an encoder-decoder model with per-beam KV caches.
//!
//! # Step protocol
//!
//! At step length `S` every live beam holds `S` tokens. Each live beam is
//! sampled (its decoder cache advances to `S` positions) and yields
//! `num_beams` candidates. All candidates are sorted by score, stably, so
//! earlier beams and earlier top-K ranks win ties. Walking the sorted list:
//!
//! - a candidate whose history satisfies the stopping criteria becomes a
//!   hypothesis and takes no slot;
//! - otherwise, if its parent slot is still outstanding it claims that slot
//!   and is appended in place;
//! - otherwise it goes to the overflow list.
//!
//! Once `num_beams` live candidates are placed, outstanding slots are
//! overwritten with overflow candidates (history prefix plus a deep copy of
//! the true parent's decoder cache). Slots left without a candidate are
//! deactivated.

use tracing::{debug, trace, warn};

use crate::config::{GenerationConfig, ModelConfig};
use crate::engine::{EncoderOutput, ModelForEncoderDecoder};
use crate::error::{Error, Result};
use crate::kv_cache::{CacheConfig, EncoderCacheMode, EncoderKVCache};
use crate::sampling::{Beam, HypothesisCollection, SampleResult, Sampler, StoppingCriteria};

/// Where a searcher is in its current (or last) search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// Single seed beam, no-cache forward, encoder cache capture.
    Seeding,
    /// All live beams, cached forward.
    Stepping,
    /// Hypotheses collected, or the search failed.
    Terminated,
}

/// Reusable beam search state for one model/config pair.
///
/// All buffers (beams with their KV caches, candidate list, overflow list,
/// outstanding-slot flags, hypotheses, encoder cache) are allocated once and
/// reused across steps and searches.
pub struct BeamSearcher {
    num_beams: usize,
    max_length: usize,
    seed: [u32; 2],
    sampler: Sampler,
    beams: Vec<Beam>,
    candidates: Vec<SampleResult>,
    outstanding: Vec<bool>,
    overflow: Vec<SampleResult>,
    hypotheses: HypothesisCollection,
    encoder_cache: EncoderKVCache,
    scratch: Vec<u32>,
    state: SearchState,
}

impl BeamSearcher {
    pub fn new(model: &ModelConfig, generation: &GenerationConfig) -> Result<Self> {
        model.validate()?;
        generation.validate(model)?;

        let num_beams = generation.num_beams;
        let head_dim = model.head_dim();
        let cache_config = CacheConfig::new(
            model.decoder_layers,
            model.decoder_attention_heads,
            head_dim,
            generation.max_length,
        );
        debug!(
            num_beams,
            max_length = generation.max_length,
            cache_bytes_per_beam = cache_config.decoder_bytes(),
            "allocating beam search buffers"
        );

        Ok(Self {
            num_beams,
            max_length: generation.max_length,
            seed: [model.decoder_start_token_id, model.bos_token_id],
            sampler: Sampler::from_config(generation, model)?,
            beams: (0..num_beams).map(|_| Beam::new(cache_config)).collect(),
            candidates: Vec::with_capacity(num_beams * num_beams),
            outstanding: vec![false; num_beams],
            overflow: Vec::with_capacity(num_beams),
            hypotheses: HypothesisCollection::new(num_beams, generation.length_penalty),
            encoder_cache: EncoderKVCache::new(
                model.encoder_layers,
                model.encoder_attention_heads,
                head_dim,
            ),
            scratch: Vec::with_capacity(generation.max_length),
            state: SearchState::Seeding,
        })
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn beams(&self) -> &[Beam] {
        &self.beams
    }

    pub fn hypotheses(&self) -> &HypothesisCollection {
        &self.hypotheses
    }

    /// Run a full search and return the best hypothesis without the
    /// decoder-start token (BOS first, EOS last when it finished on EOS).
    pub fn search<M: ModelForEncoderDecoder + ?Sized>(
        &mut self,
        model: &M,
        encoder_output: &EncoderOutput,
        stopping: &StoppingCriteria,
    ) -> Result<Vec<u32>> {
        debug!(
            num_beams = self.num_beams,
            max_length = self.max_length,
            src_len = encoder_output.src_len,
            "starting beam search"
        );
        let result = self.run(model, encoder_output, stopping);
        self.state = SearchState::Terminated;
        match &result {
            Ok(tokens) => debug!(
                len = tokens.len(),
                hypotheses = self.hypotheses.len(),
                "beam search finished"
            ),
            Err(e) => warn!(error = %e, "beam search failed"),
        }
        result
    }

    fn run<M: ModelForEncoderDecoder + ?Sized>(
        &mut self,
        model: &M,
        encoder_output: &EncoderOutput,
        stopping: &StoppingCriteria,
    ) -> Result<Vec<u32>> {
        if let Some(tokens) = self.seed_step(model, encoder_output, stopping)? {
            return Ok(tokens);
        }
        loop {
            if let Some(tokens) = self.step(model, encoder_output, stopping)? {
                return Ok(tokens);
            }
        }
    }

    /// Reset all state, sample the seed beam with the no-cache branch and
    /// select the first set of beams.
    fn seed_step<M: ModelForEncoderDecoder + ?Sized>(
        &mut self,
        model: &M,
        encoder_output: &EncoderOutput,
        stopping: &StoppingCriteria,
    ) -> Result<Option<Vec<u32>>> {
        self.state = SearchState::Seeding;
        self.hypotheses.clear();
        self.encoder_cache.clear();
        for beam in &mut self.beams {
            beam.deactivate();
        }
        self.beams[0].reset(&self.seed)?;

        self.candidates.clear();
        self.sampler.sample(
            model,
            &mut self.beams[0],
            0,
            encoder_output,
            EncoderCacheMode::Capture(&mut self.encoder_cache),
            &mut self.candidates,
        )?;

        let found = self.select(self.seed.len(), stopping)?;
        self.state = SearchState::Stepping;
        Ok(found)
    }

    /// One cached step over every live beam.
    fn step<M: ModelForEncoderDecoder + ?Sized>(
        &mut self,
        model: &M,
        encoder_output: &EncoderOutput,
        stopping: &StoppingCriteria,
    ) -> Result<Option<Vec<u32>>> {
        // Every live beam yields num_beams candidates, so the collection is
        // full before the last slot empties. Reaching here is a lost search.
        let Some(step_len) = self.beams.iter().find(|b| b.is_active()).map(Beam::len) else {
            return Err(self.exhausted());
        };
        if step_len >= self.max_length {
            return Err(self.exhausted());
        }
        trace!(step_len, "beam search step");

        self.candidates.clear();
        for (index, beam) in self.beams.iter_mut().enumerate() {
            if !beam.is_active() {
                continue;
            }
            debug_assert_eq!(beam.len(), step_len);
            self.sampler.sample(
                model,
                beam,
                index,
                encoder_output,
                EncoderCacheMode::Reuse(&self.encoder_cache),
                &mut self.candidates,
            )?;
        }

        self.select(step_len, stopping)
    }

    /// Distribute the sorted candidates over the beam slots.
    ///
    /// Returns the best hypothesis once the collection is full.
    fn select(&mut self, step_len: usize, stopping: &StoppingCriteria) -> Result<Option<Vec<u32>>> {
        // Stable: ties keep buffer order.
        self.candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.outstanding.fill(true);
        self.overflow.clear();

        let mut live = 0;
        for index in 0..self.candidates.len() {
            if live == self.num_beams {
                break;
            }
            let candidate = self.candidates[index];

            self.scratch.clear();
            self.scratch
                .extend_from_slice(&self.beams[candidate.parent].token_ids()[..step_len]);
            self.scratch.push(candidate.token_id);

            if stopping.is_done(&self.scratch) {
                self.hypotheses.add(&self.scratch, candidate.score);
                trace!(
                    parent = candidate.parent,
                    token = candidate.token_id,
                    score = candidate.score,
                    finished = self.hypotheses.len(),
                    "hypothesis finished"
                );
                if self.hypotheses.is_full() {
                    return Ok(self.best_tokens());
                }
                continue;
            }

            live += 1;
            if self.outstanding[candidate.parent] {
                self.outstanding[candidate.parent] = false;
                self.beams[candidate.parent].append(&candidate)?;
                trace!(slot = candidate.parent, token = candidate.token_id, "append");
            } else {
                self.overflow.push(candidate);
            }
        }

        let mut next = 0;
        for slot in 0..self.num_beams {
            if !self.outstanding[slot] {
                continue;
            }
            match self.overflow.get(next).copied() {
                Some(candidate) => {
                    next += 1;
                    let (target, source) = pair_mut(&mut self.beams, slot, candidate.parent);
                    target.fork_from(source, &candidate, step_len)?;
                    self.outstanding[slot] = false;
                    trace!(
                        slot,
                        parent = candidate.parent,
                        token = candidate.token_id,
                        "fork"
                    );
                }
                None => {
                    self.beams[slot].deactivate();
                    trace!(slot, "deactivate");
                }
            }
        }
        Ok(None)
    }

    fn best_tokens(&self) -> Option<Vec<u32>> {
        self.hypotheses
            .best()
            .map(|h| h.token_ids.iter().skip(1).copied().collect())
    }

    fn exhausted(&self) -> Error {
        Error::Exhausted {
            max_length: self.max_length,
            finished: self.hypotheses.len(),
            required: self.num_beams,
        }
    }
}

/// Borrow `beams[target]` mutably and `beams[source]` shared.
fn pair_mut(beams: &mut [Beam], target: usize, source: usize) -> (&mut Beam, &Beam) {
    debug_assert_ne!(target, source);
    if target < source {
        let (left, right) = beams.split_at_mut(source);
        (&mut left[target], &right[0])
    } else {
        let (left, right) = beams.split_at_mut(target);
        (&mut right[0], &left[source])
    }
}
