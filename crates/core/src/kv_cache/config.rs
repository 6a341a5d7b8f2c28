use super::view::KvShape;

/// Geometry of one KV cache collection.
///
/// All buffers are allocated for `max_seq_len` positions up front; the
/// per-step views only expose the valid prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub max_seq_len: usize,
}

impl CacheConfig {
    pub fn new(num_layers: usize, num_heads: usize, head_dim: usize, max_seq_len: usize) -> Self {
        Self {
            num_layers,
            num_heads,
            head_dim,
            max_seq_len,
        }
    }

    /// Logical shape `[1, num_heads, seq_len, head_dim]` of a view.
    pub fn shape(&self, seq_len: usize) -> KvShape {
        KvShape::new(self.num_heads, seq_len, self.head_dim)
    }

    /// Number of `f32` elements one key (or value) buffer holds.
    ///
    /// elems = num_heads * max_seq_len * head_dim
    pub fn layer_capacity(&self) -> usize {
        self.shape(self.max_seq_len).elem_count()
    }

    /// Bytes held by one decoder cache: 4 buffers (past/present × key/value)
    /// per layer.
    pub fn decoder_bytes(&self) -> usize {
        4 * self.num_layers * self.layer_capacity() * std::mem::size_of::<f32>()
    }
}
