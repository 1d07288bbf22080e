use crate::error::{Error, Result};
use crate::shape::Shape;

/// A per-dimension selection `start..end` taken every `step` elements.
///
/// `end == None` means "to the end of the dimension".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceRange {
    pub start: usize,
    pub end: Option<usize>,
    pub step: usize,
}

impl SliceRange {
    /// The whole dimension.
    pub fn all() -> Self {
        SliceRange {
            start: 0,
            end: None,
            step: 1,
        }
    }

    /// Elements `start..end`.
    pub fn interval(start: usize, end: usize) -> Self {
        SliceRange {
            start,
            end: Some(end),
            step: 1,
        }
    }

    /// A single element; the dimension is kept with size 1.
    pub fn index(i: usize) -> Self {
        SliceRange::interval(i, i + 1)
    }

    /// Elements `start..end` taking every `step`-th one.
    pub fn stepped(start: usize, end: usize, step: usize) -> Self {
        SliceRange {
            start,
            end: Some(end),
            step,
        }
    }

    /// Elements from `start` to the end of the dimension.
    pub fn from(start: usize) -> Self {
        SliceRange {
            start,
            end: None,
            step: 1,
        }
    }
}

impl From<std::ops::Range<usize>> for SliceRange {
    fn from(r: std::ops::Range<usize>) -> Self {
        SliceRange::interval(r.start, r.end)
    }
}

impl From<std::ops::RangeFull> for SliceRange {
    fn from(_: std::ops::RangeFull) -> Self {
        SliceRange::all()
    }
}

impl From<usize> for SliceRange {
    fn from(i: usize) -> Self {
        SliceRange::index(i)
    }
}

/// A slice range checked against a concrete dimension size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedRange {
    pub start: usize,
    pub len: usize,
    pub step: usize,
}

impl ResolvedRange {
    /// Source coordinate of output coordinate `i`.
    #[inline]
    pub fn source(&self, i: usize) -> usize {
        self.start + i * self.step
    }

    /// Whether this range keeps the whole dimension unchanged.
    pub fn is_full(&self, size: usize) -> bool {
        self.start == 0 && self.step == 1 && self.len == size
    }
}

/// Check `ranges` against `shape`. Dimensions beyond the given ranges keep
/// their full extent.
pub fn resolve_ranges(shape: &Shape, ranges: &[SliceRange]) -> Result<Vec<ResolvedRange>> {
    let rank = shape.rank();
    if ranges.len() > rank {
        return Err(Error::TooManySliceRanges {
            ranges: ranges.len(),
            rank,
        });
    }
    let mut resolved = Vec::with_capacity(rank);
    for (dim, &size) in shape.dims().iter().enumerate() {
        let r = ranges.get(dim).copied().unwrap_or_else(SliceRange::all);
        let end = r.end.unwrap_or(size);
        if r.step == 0 || r.start > end || end > size {
            return Err(Error::SliceOutOfBounds {
                dim,
                start: r.start,
                end,
                step: r.step,
                size,
            });
        }
        let len = (end - r.start).div_ceil(r.step);
        resolved.push(ResolvedRange {
            start: r.start,
            len,
            step: r.step,
        });
    }
    Ok(resolved)
}

/// Output shape of a slice.
pub fn sliced_shape(ranges: &[ResolvedRange]) -> Shape {
    Shape::new(ranges.iter().map(|r| r.len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_missing_dims_as_full() {
        let shape = Shape::from((4, 6));
        let r = resolve_ranges(&shape, &[SliceRange::interval(1, 3)]).unwrap();
        assert_eq!(sliced_shape(&r).dims(), &[2, 6]);
        assert!(r[1].is_full(6));
    }

    #[test]
    fn stepped_length_rounds_up() {
        let shape = Shape::from(7);
        let r = resolve_ranges(&shape, &[SliceRange::stepped(0, 7, 3)]).unwrap();
        // 0, 3, 6
        assert_eq!(r[0].len, 3);
        assert_eq!(r[0].source(2), 6);
    }

    #[test]
    fn rejects_bad_ranges() {
        let shape = Shape::from((2, 2));
        assert!(matches!(
            resolve_ranges(&shape, &[SliceRange::all(); 3]),
            Err(Error::TooManySliceRanges { ranges: 3, rank: 2 })
        ));
        assert!(matches!(
            resolve_ranges(&shape, &[SliceRange::interval(0, 3)]),
            Err(Error::SliceOutOfBounds { dim: 0, .. })
        ));
        assert!(resolve_ranges(&shape, &[SliceRange::stepped(0, 2, 0)]).is_err());
    }
}
