use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — how a tensor's logical shape maps onto flat storage
//
// A layout is a shape plus one stride per dimension. Element (i0, i1, ...)
// lives at storage position sum(ik * stride[k]).
//
//   contiguous [2, 3]         strides [3, 1]
//   transpose(0, 1) → [3, 2]  strides [1, 3]   (same storage, no copy)
//
// Transposing and permuting only rearrange strides, so the resulting tensor
// shares storage with its source. The `transposed` flag records that the
// layout came from such a rearrangement; kernels use it to pick a strided
// path, and `Tensor::is_transposed` reports it.
//
// Slicing always materializes a new storage, so layouts never carry an
// offset: every view starts at storage position 0.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    transposed: bool,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            transposed: false,
        }
    }

    /// Create a layout with explicit strides.
    pub fn new(shape: Shape, strides: Vec<usize>) -> Self {
        let transposed = strides != shape.stride_contiguous();
        Layout {
            shape,
            strides,
            transposed,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this layout walks storage in plain row-major order.
    pub fn is_contiguous(&self) -> bool {
        if self.elem_count() <= 1 {
            return true;
        }
        // Size-1 dims never move the cursor, so their stride is irrelevant.
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(expected.iter()))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Whether this layout is a transposed/permuted view of its storage.
    pub fn is_transposed(&self) -> bool {
        self.transposed && !self.is_contiguous()
    }

    /// Transpose two dimensions. Returns a new layout with swapped shape/strides.
    ///
    /// Example: [2, 3, 4] transpose(0, 2) → [4, 3, 2]
    ///          strides [12, 4, 1]         → [1, 4, 12]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides: new_strides,
            transposed: self.transposed || dim0 != dim1,
        })
    }

    /// Reorder dimensions: output dim i is input dim `dims[i]`.
    pub fn permute(&self, dims: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if dims.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: dims.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &d in dims {
            if d >= rank || seen[d] {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
            seen[d] = true;
        }
        let new_dims: Vec<usize> = dims.iter().map(|&d| self.dims()[d]).collect();
        let new_strides: Vec<usize> = dims.iter().map(|&d| self.strides[d]).collect();
        let identity = dims.iter().enumerate().all(|(i, &d)| i == d);
        Ok(Layout {
            shape: Shape::new(new_dims),
            strides: new_strides,
            transposed: self.transposed || !identity,
        })
    }

    /// This layout viewed at a larger broadcast `target` shape
    /// (stretched dims get stride 0).
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let strides = self.shape.broadcast_strides(&self.strides, target)?;
        Ok(Layout {
            shape: target.clone(),
            strides,
            transposed: self.transposed,
        })
    }

    /// Storage position of a multi-dimensional index, bounds-checked.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::IndexRankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (dim, (&i, &size)) in index.iter().zip(self.dims()).enumerate() {
            if i >= size {
                return Err(Error::IndexOutOfBounds {
                    dim,
                    index: i,
                    size,
                });
            }
        }
        Ok(flatten_index(index, &self.strides))
    }

    /// Iterator over all storage positions of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Dot product of an index with strides: the storage position of `index`.
pub fn flatten_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Inverse of row-major flattening: split `flat` into per-dim coordinates.
pub fn unravel_index(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for d in (0..dims.len()).rev() {
        let size = dims[d].max(1);
        out[d] = flat % size;
        flat /= size;
    }
}

// StridedIter — storage positions of a layout in logical (row-major) order
//
// For a contiguous layout this counts 0, 1, 2, ...; for a transposed one it
// jumps through storage following the strides. The cursor is advanced
// incrementally, adding and subtracting strides instead of recomputing the
// full dot product for each element.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    position: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            position: 0,
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.position += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.position -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
