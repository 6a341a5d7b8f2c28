//! Beam search sampling infrastructure.
//!
//! This module provides:
//! - Logits processors (no-repeat-n-gram, forced BOS/EOS)
//! - Per-beam state and finished-hypothesis collection
//! - The per-step sampler that turns one decode call into beam candidates
//! - Stopping criteria

mod beam;
pub mod logits_processor;
mod sampler;
pub mod stopping;

pub use beam::{Beam, Hypothesis, HypothesisCollection, SampleResult};
pub use logits_processor::{
    ForcedBosTokenProcessor, ForcedEosTokenProcessor, LogitsProcessor, LogitsProcessorPipeline,
    NoRepeatNGramProcessor,
};
pub use sampler::Sampler;
pub use stopping::{EosTokenCriterion, MaxLengthCriterion, StoppingCriteria, StoppingCriterion};

use std::cmp::Ordering;

/// Output of a top-K selection: values in descending order with their
/// vocabulary indices.
#[derive(Debug, Clone, PartialEq)]
pub struct TopK {
    pub values: Vec<f32>,
    pub indices: Vec<u32>,
}

impl TopK {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Total order used for top-K: larger value first, lower index on ties.
/// NaN sorts last.
fn rank(a: &(u32, f32), b: &(u32, f32)) -> Ordering {
    match (a.1.is_nan(), b.1.is_nan()) {
        (true, true) => a.0.cmp(&b.0),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)),
    }
}

/// CPU top-K over one logits row. `k` is clamped to the row length.
pub fn top_k(logits: &[f32], k: usize) -> TopK {
    let k = k.min(logits.len());
    if k == 0 {
        return TopK {
            values: Vec::new(),
            indices: Vec::new(),
        };
    }

    let mut indexed: Vec<(u32, f32)> = logits
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, v))
        .collect();
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, rank);
        indexed.truncate(k);
    }
    indexed.sort_unstable_by(rank);

    let (indices, values) = indexed.into_iter().unzip();
    TopK { values, indices }
}

/// Compute log-softmax in a numerically stable way, in f64.
/// log_softmax(x_i) = x_i - max(x) - log(sum(exp(x_j - max(x))))
///
/// A row with no finite maximum maps to all `-inf`.
pub fn log_softmax(values: &[f32]) -> Vec<f64> {
    let max_value = values
        .iter()
        .map(|&v| v as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_value.is_finite() {
        return vec![f64::NEG_INFINITY; values.len()];
    }
    let exp_sum_ln = values
        .iter()
        .map(|&v| (v as f64 - max_value).exp())
        .sum::<f64>()
        .ln();
    values
        .iter()
        .map(|&v| v as f64 - max_value - exp_sum_ln)
        .collect()
}
