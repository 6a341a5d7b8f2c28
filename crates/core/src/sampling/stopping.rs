//! Stopping criteria evaluated on a candidate's full token history.

/// Decides whether a token history is finished. Must be side-effect free.
pub trait StoppingCriterion: Send + Sync {
    fn is_done(&self, token_ids: &[u32]) -> bool;
}

/// Done once the history reaches `max_length` tokens.
#[derive(Debug, Clone, Copy)]
pub struct MaxLengthCriterion {
    max_length: usize,
}

impl MaxLengthCriterion {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl StoppingCriterion for MaxLengthCriterion {
    fn is_done(&self, token_ids: &[u32]) -> bool {
        token_ids.len() >= self.max_length
    }
}

/// Done when the last token is EOS.
#[derive(Debug, Clone, Copy)]
pub struct EosTokenCriterion {
    eos_token_id: u32,
}

impl EosTokenCriterion {
    pub fn new(eos_token_id: u32) -> Self {
        Self { eos_token_id }
    }
}

impl StoppingCriterion for EosTokenCriterion {
    fn is_done(&self, token_ids: &[u32]) -> bool {
        token_ids.last() == Some(&self.eos_token_id)
    }
}

/// Criteria combined by OR. An empty set never stops.
#[derive(Default)]
pub struct StoppingCriteria {
    criteria: Vec<Box<dyn StoppingCriterion>>,
}

impl StoppingCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Max length plus EOS, the set used for normal generation.
    pub fn with_defaults(max_length: usize, eos_token_id: u32) -> Self {
        let mut criteria = Self::new();
        criteria.push(Box::new(MaxLengthCriterion::new(max_length)));
        criteria.push(Box::new(EosTokenCriterion::new(eos_token_id)));
        criteria
    }

    pub fn push(&mut self, criterion: Box<dyn StoppingCriterion>) {
        self.criteria.push(criterion);
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn is_done(&self, token_ids: &[u32]) -> bool {
        self.criteria.iter().any(|c| c.is_done(token_ids))
    }
}

impl std::fmt::Debug for StoppingCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppingCriteria")
            .field("len", &self.criteria.len())
            .finish()
    }
}
