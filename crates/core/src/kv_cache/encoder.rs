use super::error::CacheError;
use super::view::{KeyValue, KeyValueMut, KvShape, KvView, KvViewMut};

/// Cross-attention key/value cache shared by every beam of a search.
///
/// The decoder fills it once, on the first (no-cache) call; afterwards it is
/// only read. Capture hands out writable views, reuse hands out read-only
/// views, so a captured cache cannot be written through a reuse borrow.
#[derive(Debug, Clone)]
pub struct EncoderKVCache {
    layers: Vec<(Vec<f32>, Vec<f32>)>,
    num_heads: usize,
    head_dim: usize,
    seq_len: Option<usize>,
}

impl EncoderKVCache {
    pub fn new(num_layers: usize, num_heads: usize, head_dim: usize) -> Self {
        Self {
            layers: vec![(Vec::new(), Vec::new()); num_layers],
            num_heads,
            head_dim,
            seq_len: None,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Encoder sequence length, once captured.
    pub fn seq_len(&self) -> Option<usize> {
        self.seq_len
    }

    pub fn is_captured(&self) -> bool {
        self.seq_len.is_some()
    }

    /// Drop the captured contents; the next search captures again.
    pub fn clear(&mut self) {
        self.seq_len = None;
    }

    /// Size every layer for `seq_len` encoder positions and return, per
    /// layer, an empty past view and a writable present view.
    ///
    /// The cache counts as captured from here on; the caller is expected to
    /// fill the views in the same decode call.
    pub fn begin_capture(&mut self, seq_len: usize) -> Vec<(KeyValue<'static>, KeyValueMut<'_>)> {
        let shape = KvShape::new(self.num_heads, seq_len, self.head_dim);
        let elems = shape.elem_count();
        let (num_heads, head_dim) = (self.num_heads, self.head_dim);
        self.seq_len = Some(seq_len);

        self.layers
            .iter_mut()
            .map(|(key, value)| {
                key.clear();
                key.resize(elems, 0.0);
                value.clear();
                value.resize(elems, 0.0);
                (
                    KeyValue {
                        key: KvView::empty(num_heads, head_dim),
                        value: KvView::empty(num_heads, head_dim),
                    },
                    KeyValueMut {
                        key: KvViewMut::new(key, shape),
                        value: KvViewMut::new(value, shape),
                    },
                )
            })
            .collect()
    }

    /// Read-only views of the captured contents.
    pub fn views(&self) -> Result<Vec<KeyValue<'_>>, CacheError> {
        let seq_len = self.seq_len.ok_or(CacheError::EncoderNotCaptured)?;
        let shape = KvShape::new(self.num_heads, seq_len, self.head_dim);
        Ok(self
            .layers
            .iter()
            .map(|(key, value)| KeyValue {
                key: KvView::new(key, shape),
                value: KvView::new(value, shape),
            })
            .collect())
    }
}

/// How a decode call treats the encoder cache.
#[derive(Debug)]
pub enum EncoderCacheMode<'a> {
    /// First call of a search: the decoder computes cross-attention keys and
    /// values and writes them into the cache.
    Capture(&'a mut EncoderKVCache),
    /// Every later call: the decoder reads the captured keys and values.
    Reuse(&'a EncoderKVCache),
}

impl EncoderCacheMode<'_> {
    pub fn is_capture(&self) -> bool {
        matches!(self, Self::Capture(_))
    }
}
