//! Borrowed, shape-tagged windows into KV cache buffers.
//!
//! A view lives for exactly one decode call. Because it borrows the cache,
//! the borrow checker rules out holding a buffer across a swap.

use candle_core::{Device, Tensor};

use super::error::CacheError;

/// Logical shape `[1, num_heads, seq_len, head_dim]` of a KV view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvShape {
    pub num_heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

impl KvShape {
    pub fn new(num_heads: usize, seq_len: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            seq_len,
            head_dim,
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        [1, self.num_heads, self.seq_len, self.head_dim]
    }

    pub fn elem_count(&self) -> usize {
        self.num_heads * self.seq_len * self.head_dim
    }

    /// Flat offset of `(head, position, dim)` in a contiguous buffer of this shape.
    pub fn offset(&self, head: usize, position: usize, dim: usize) -> usize {
        (head * self.seq_len + position) * self.head_dim + dim
    }
}

/// Read-only view used as decoder input.
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    data: &'a [f32],
    shape: KvShape,
}

impl<'a> KvView<'a> {
    pub(crate) fn new(data: &'a [f32], shape: KvShape) -> Self {
        debug_assert_eq!(data.len(), shape.elem_count());
        Self { data, shape }
    }

    /// Zero-length view, used for the encoder past on the capture step.
    pub(crate) fn empty(num_heads: usize, head_dim: usize) -> Self {
        Self {
            data: &[],
            shape: KvShape::new(num_heads, 0, head_dim),
        }
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn seq_len(&self) -> usize {
        self.shape.seq_len
    }

    /// Copy the view into a `[1, heads, seq, head_dim]` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor, CacheError> {
        Ok(Tensor::from_slice(self.data, self.shape.dims().to_vec(), device)?)
    }
}

/// Writable view the decoder fills with its present key or value.
#[derive(Debug)]
pub struct KvViewMut<'a> {
    data: &'a mut [f32],
    shape: KvShape,
}

impl<'a> KvViewMut<'a> {
    pub(crate) fn new(data: &'a mut [f32], shape: KvShape) -> Self {
        debug_assert_eq!(data.len(), shape.elem_count());
        Self { data, shape }
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut *self.data
    }

    pub fn data(&self) -> &[f32] {
        &*self.data
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn seq_len(&self) -> usize {
        self.shape.seq_len
    }

    /// Write a decoder output tensor into this view.
    ///
    /// The tensor must have exactly the view's logical shape.
    pub fn write_tensor(&mut self, tensor: &Tensor) -> Result<(), CacheError> {
        let expected = self.shape.dims();
        if tensor.dims() != expected.as_slice() {
            return Err(CacheError::ShapeMismatch {
                expected,
                actual: tensor.dims().to_vec(),
            });
        }
        let values = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        self.data.copy_from_slice(&values);
        Ok(())
    }
}

/// Key/value pair of read-only views.
#[derive(Debug, Clone, Copy)]
pub struct KeyValue<'a> {
    pub key: KvView<'a>,
    pub value: KvView<'a>,
}

/// Key/value pair of writable views.
#[derive(Debug)]
pub struct KeyValueMut<'a> {
    pub key: KvViewMut<'a>,
    pub value: KvViewMut<'a>,
}

/// Everything one decoder layer reads and writes during a decode call.
///
/// `present_encoder` is only populated on the capture (no-cache) step.
#[derive(Debug)]
pub struct LayerKeyValues<'a> {
    pub past_decoder: KeyValue<'a>,
    pub present_decoder: KeyValueMut<'a>,
    pub past_encoder: KeyValue<'a>,
    pub present_encoder: Option<KeyValueMut<'a>>,
}
