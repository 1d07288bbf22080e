use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional extent of a tensor
//
//   Scalar: Shape([])          — 0 dimensions, 1 element
//   Vector: Shape([5])         — 1 dimension, 5 elements
//   Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//   Batch:  Shape([2, 3, 4])   — 3 dimensions, 24 elements
//
// A dimension of size 0 is legal and makes the tensor empty.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element; any
    /// zero-sized dimension makes the count 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// This shape with leading 1s added until it has `rank` dimensions.
    pub fn padded_to(&self, rank: usize) -> Shape {
        if rank <= self.rank() {
            return self.clone();
        }
        let mut dims = vec![1; rank - self.rank()];
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    /// Split off the last two dimensions: (batch, rows, cols).
    pub fn matrix_dims(&self) -> Result<(&[usize], usize, usize)> {
        let r = self.rank();
        if r < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: r,
            });
        }
        Ok((&self.0[..r - 2], self.0[r - 2], self.0[r - 1]))
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [5, 3, 1] and [3, 4] → [5, 3, 4]
    ///   [3] and [4]          → NotBroadcastable
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::NotBroadcastable {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Whether this shape can be broadcast into `target` without changing
    /// `target` (the in-place arithmetic condition).
    pub fn broadcasts_into(&self, target: &Shape) -> bool {
        matches!(Shape::broadcast_shape(target, self), Ok(ref s) if s == target)
    }

    /// Broadcast strides of `strides` (laid out over `self`) against `target`.
    ///
    /// Dimensions of size 1 that stretch, and missing leading dimensions,
    /// get stride 0 so the same element is revisited. Fails when `self`
    /// does not broadcast into `target` unchanged.
    pub fn broadcast_strides(&self, strides: &[usize], target: &Shape) -> Result<Vec<usize>> {
        if !self.broadcasts_into(target) {
            return Err(Error::NotBroadcastable {
                lhs: target.clone(),
                rhs: self.clone(),
            });
        }
        if strides.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: strides.len(),
            });
        }
        let self_dims = self.dims();
        let target_dims = target.dims();
        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = strides[i];
            }
        }
        Ok(result)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn test_empty_dim() {
        let s = Shape::from((0, 3));
        assert_eq!(s.elem_count(), 0);
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::from((5, 3, 1));
        let b = Shape::from((3, 4));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap().dims(), &[5, 3, 4]);
        let err = Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).unwrap_err();
        assert!(matches!(err, Error::NotBroadcastable { .. }));
    }

    #[test]
    fn test_broadcasts_into() {
        let target = Shape::from((2, 3));
        assert!(Shape::from(3).broadcasts_into(&target));
        assert!(Shape::from((1, 3)).broadcasts_into(&target));
        assert!(!Shape::from((4, 3)).broadcasts_into(&target));
        // would grow the receiver
        assert!(!Shape::from((2, 2, 3)).broadcasts_into(&target));
    }

    #[test]
    fn test_broadcast_strides() {
        let s = Shape::from((3, 1));
        let strides = s.stride_contiguous();
        let target = Shape::from((2, 3, 4));
        assert_eq!(s.broadcast_strides(&strides, &target).unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_broadcast_strides_rejects_larger_or_mismatched_shape() {
        let big = Shape::from((2, 3, 4));
        let small = Shape::from((3, 4));
        let err = big
            .broadcast_strides(&big.stride_contiguous(), &small)
            .unwrap_err();
        assert!(matches!(err, Error::NotBroadcastable { .. }));

        let wrong = Shape::from((5, 4));
        assert!(matches!(
            wrong.broadcast_strides(&wrong.stride_contiguous(), &big),
            Err(Error::NotBroadcastable { .. })
        ));
        assert!(matches!(
            small.broadcast_strides(&[4], &big),
            Err(Error::RankMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
