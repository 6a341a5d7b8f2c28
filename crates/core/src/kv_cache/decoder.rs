use super::config::CacheConfig;
use super::error::CacheError;
use super::view::{KeyValue, KeyValueMut, KvView, KvViewMut};

/// Marker for cache slots that have never been written.
const UNWRITTEN: f32 = f32::NEG_INFINITY;

/// Past/present pair for one key or value tensor.
///
/// The decoder reads `past` and writes `present`; `swap` turns this step's
/// present into next step's past without copying.
#[derive(Debug, Clone)]
struct DoubleBuffer {
    past: Vec<f32>,
    present: Vec<f32>,
}

impl DoubleBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            past: vec![UNWRITTEN; capacity],
            present: vec![UNWRITTEN; capacity],
        }
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.past, &mut self.present);
    }

    fn copy_from(&mut self, other: &DoubleBuffer, past_elems: usize, present_elems: usize) {
        self.past[..past_elems].copy_from_slice(&other.past[..past_elems]);
        self.present[..present_elems].copy_from_slice(&other.present[..present_elems]);
    }
}

#[derive(Debug, Clone)]
struct LayerCache {
    key: DoubleBuffer,
    value: DoubleBuffer,
}

/// Per-beam decoder self-attention cache.
///
/// `seq_len` is the number of positions held in the past buffers, i.e. the
/// present length of the last decode call. Each step the decoder receives a
/// past view of `seq_len` positions and a present view of `present_len`
/// positions; `advance(present_len)` then swaps the buffers.
///
/// Ownership of a lineage never moves implicitly: `advance` is the only way
/// data flows present→past, and `fork_from` is the only way it flows between
/// caches.
#[derive(Debug, Clone)]
pub struct DecoderKVCache {
    config: CacheConfig,
    layers: Vec<LayerCache>,
    seq_len: usize,
}

impl DecoderKVCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.layer_capacity();
        let layers = (0..config.num_layers)
            .map(|_| LayerCache {
                key: DoubleBuffer::new(capacity),
                value: DoubleBuffer::new(capacity),
            })
            .collect();
        Self {
            config,
            layers,
            seq_len: 0,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Positions currently cached in the past buffers.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Forget the cached lineage. Buffers are kept for reuse.
    pub fn reset(&mut self) {
        self.seq_len = 0;
    }

    /// Build per-layer views for a decode call producing `present_len` positions.
    pub fn layer_views(
        &mut self,
        present_len: usize,
    ) -> Result<Vec<(KeyValue<'_>, KeyValueMut<'_>)>, CacheError> {
        self.check_present_len(present_len)?;

        let past_shape = self.config.shape(self.seq_len);
        let present_shape = self.config.shape(present_len);
        let past_elems = past_shape.elem_count();
        let present_elems = present_shape.elem_count();

        let views = self
            .layers
            .iter_mut()
            .map(|layer| {
                let DoubleBuffer {
                    past: past_key,
                    present: present_key,
                } = &mut layer.key;
                let DoubleBuffer {
                    past: past_value,
                    present: present_value,
                } = &mut layer.value;
                (
                    KeyValue {
                        key: KvView::new(&past_key[..past_elems], past_shape),
                        value: KvView::new(&past_value[..past_elems], past_shape),
                    },
                    KeyValueMut {
                        key: KvViewMut::new(&mut present_key[..present_elems], present_shape),
                        value: KvViewMut::new(&mut present_value[..present_elems], present_shape),
                    },
                )
            })
            .collect();
        Ok(views)
    }

    /// Swap past and present buffers after a decode call.
    ///
    /// What the decoder wrote as present becomes the past for the next call.
    pub fn advance(&mut self, present_len: usize) -> Result<(), CacheError> {
        self.check_present_len(present_len)?;
        for layer in &mut self.layers {
            layer.key.swap();
            layer.value.swap();
        }
        self.seq_len = present_len;
        Ok(())
    }

    /// Deep-copy another cache's valid region into this one.
    ///
    /// Used when this cache's owner takes over another beam's lineage; after
    /// the copy the two caches share no storage.
    pub fn fork_from(&mut self, other: &DecoderKVCache) -> Result<(), CacheError> {
        if self.config != other.config {
            return Err(CacheError::LayoutMismatch {
                expected: format!("{:?}", self.config),
                found: format!("{:?}", other.config),
            });
        }

        let past_elems = self.config.shape(other.seq_len).elem_count();
        // The present buffers hold the previous step's past.
        let present_elems = self
            .config
            .shape(other.seq_len.saturating_sub(1))
            .elem_count();

        for (dst, src) in self.layers.iter_mut().zip(&other.layers) {
            dst.key.copy_from(&src.key, past_elems, present_elems);
            dst.value.copy_from(&src.value, past_elems, present_elems);
        }
        self.seq_len = other.seq_len;
        Ok(())
    }

    /// Valid past key region of `layer`, laid out `[1, heads, seq_len, head_dim]`.
    ///
    /// `None` when `layer` is out of range.
    pub fn past_key(&self, layer: usize) -> Option<&[f32]> {
        let elems = self.config.shape(self.seq_len).elem_count();
        self.layers.get(layer).map(|l| &l.key.past[..elems])
    }

    /// Valid past value region of `layer`, `None` when out of range.
    pub fn past_value(&self, layer: usize) -> Option<&[f32]> {
        let elems = self.config.shape(self.seq_len).elem_count();
        self.layers.get(layer).map(|l| &l.value.past[..elems])
    }

    fn check_present_len(&self, present_len: usize) -> Result<(), CacheError> {
        if present_len > self.config.max_seq_len {
            return Err(CacheError::CapacityExceeded {
                requested: present_len,
                capacity: self.config.max_seq_len,
            });
        }
        if present_len <= self.seq_len {
            return Err(CacheError::NonAdvancingStep {
                past_len: self.seq_len,
                present_len,
            });
        }
        Ok(())
    }
}
