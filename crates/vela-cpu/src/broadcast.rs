// Broadcast engine
//
// Element-wise binary ops pick the cheapest correct strategy:
//
//   Same       identical shapes, both contiguous       zipped lanes
//   Scalar     one side has a single element           map with a constant
//   Pattern    both contiguous and the smaller operand, right-aligned, is
//              [outer.., 1.., inner..] against the output. This covers
//              rank-2 + vector, rank-3 + trailing matrix or vector, and
//              [B, m, d] + [B, 1, d]. The small index is
//              (i / (batch·inner))·inner + i % inner.
//   Generic    anything else: every operand walks the output index space
//              with stride 0 on the dims where its size is 1.
//
// All paths produce identical results; the property tests check the fast
// paths against `binary_generic`.
//
// sum_to_shape is the inverse: it sums the axes that broadcasting stretched.

use vela_core::layout::{unravel_index, Layout};
use vela_core::{BinaryOp, Error, Result, Shape};

use crate::config::HostConfig;
use crate::parallel::{fork_join, fork_join_sum};
use crate::simd;

/// Multi-operand strided walk over an index space in row-major order.
pub(crate) struct Cursor<const N: usize> {
    coords: Vec<usize>,
    dims: Vec<usize>,
    strides: [Vec<usize>; N],
    pub(crate) pos: [usize; N],
}

impl<const N: usize> Cursor<N> {
    /// Cursor positioned at logical element `start`.
    pub(crate) fn new(dims: &[usize], strides: [&[usize]; N], start: usize) -> Self {
        let mut coords = vec![0; dims.len()];
        unravel_index(start, dims, &mut coords);
        let strides = strides.map(|s| s.to_vec());
        let mut pos = [0usize; N];
        for (p, s) in pos.iter_mut().zip(strides.iter()) {
            *p = coords.iter().zip(s).map(|(c, st)| c * st).sum();
        }
        Cursor {
            coords,
            dims: dims.to_vec(),
            strides,
            pos,
        }
    }

    #[inline]
    pub(crate) fn advance(&mut self) {
        for d in (0..self.dims.len()).rev() {
            self.coords[d] += 1;
            for k in 0..N {
                self.pos[k] += self.strides[k][d];
            }
            if self.coords[d] < self.dims[d] {
                return;
            }
            for k in 0..N {
                self.pos[k] -= self.coords[d] * self.strides[k][d];
            }
            self.coords[d] = 0;
        }
    }
}

/// Shape of a contiguous broadcast between a full operand and a smaller one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    pub batch: usize,
    pub inner: usize,
}

impl Pattern {
    /// Detect `small` (right-aligned) as [outer.., 1.., inner..] against `full`.
    pub fn detect(full: &Shape, small: &Shape) -> Option<Pattern> {
        if small.rank() > full.rank() {
            return None;
        }
        let small = small.padded_to(full.rank());
        let f = full.dims();
        let s = small.dims();
        let rank = f.len();
        let mut i = 0;
        while i < rank && s[i] == f[i] {
            i += 1;
        }
        let middle_start = i;
        while i < rank && s[i] == 1 {
            i += 1;
        }
        let suffix_start = i;
        if s[suffix_start..] != f[suffix_start..] {
            return None;
        }
        let batch: usize = f[middle_start..suffix_start].iter().product();
        let inner: usize = f[suffix_start..].iter().product();
        Some(Pattern { batch, inner })
    }

    #[inline(always)]
    pub fn small_index(&self, i: usize) -> usize {
        (i / (self.batch * self.inner)) * self.inner + i % self.inner
    }
}

/// The strategy `binary` would use for these operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Same,
    ScalarRhs,
    ScalarLhs,
    /// The right operand is the small side.
    RhsPattern(Pattern),
    /// The left operand is the small side.
    LhsPattern(Pattern),
    Generic,
}

pub fn plan(lhs: &Layout, rhs: &Layout, out: &Shape) -> Plan {
    let contiguous = lhs.is_contiguous() && rhs.is_contiguous();
    if !contiguous {
        return Plan::Generic;
    }
    if lhs.shape() == rhs.shape() {
        return Plan::Same;
    }
    if rhs.elem_count() == 1 && lhs.shape() == out {
        return Plan::ScalarRhs;
    }
    if lhs.elem_count() == 1 && rhs.shape() == out {
        return Plan::ScalarLhs;
    }
    if lhs.shape() == out {
        if let Some(p) = Pattern::detect(out, rhs.shape()) {
            return Plan::RhsPattern(p);
        }
    }
    if rhs.shape() == out {
        if let Some(p) = Pattern::detect(out, lhs.shape()) {
            return Plan::LhsPattern(p);
        }
    }
    Plan::Generic
}

/// op(lhs, rhs) at the broadcast shape of both layouts.
pub fn binary(
    cfg: &HostConfig,
    op: BinaryOp,
    lhs: &[f32],
    lhs_layout: &Layout,
    rhs: &[f32],
    rhs_layout: &Layout,
) -> Result<Vec<f32>> {
    let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
    let n = out_shape.elem_count();
    let mut out = vec![0.0f32; n];
    match plan(lhs_layout, rhs_layout, &out_shape) {
        Plan::Same => fork_join(cfg, &mut out, &|offset, piece| {
            let end = offset + piece.len();
            simd::zip_map(&lhs[offset..end], &rhs[offset..end], piece, |a, b| {
                op.apply(a, b)
            });
        }),
        Plan::ScalarRhs => {
            let b = rhs[0];
            fork_join(cfg, &mut out, &|offset, piece| {
                simd::map(&lhs[offset..offset + piece.len()], piece, |a| op.apply(a, b));
            })
        }
        Plan::ScalarLhs => {
            let a = lhs[0];
            fork_join(cfg, &mut out, &|offset, piece| {
                simd::map(&rhs[offset..offset + piece.len()], piece, |b| op.apply(a, b));
            })
        }
        Plan::RhsPattern(p) => fork_join(cfg, &mut out, &|offset, piece| {
            for (k, o) in piece.iter_mut().enumerate() {
                let i = offset + k;
                *o = op.apply(lhs[i], rhs[p.small_index(i)]);
            }
        }),
        Plan::LhsPattern(p) => fork_join(cfg, &mut out, &|offset, piece| {
            for (k, o) in piece.iter_mut().enumerate() {
                let i = offset + k;
                *o = op.apply(lhs[p.small_index(i)], rhs[i]);
            }
        }),
        Plan::Generic => return binary_generic(cfg, op, lhs, lhs_layout, rhs, rhs_layout),
    }
    Ok(out)
}

/// The general strided broadcast, valid for any compatible layouts.
pub fn binary_generic(
    cfg: &HostConfig,
    op: BinaryOp,
    lhs: &[f32],
    lhs_layout: &Layout,
    rhs: &[f32],
    rhs_layout: &Layout,
) -> Result<Vec<f32>> {
    let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
    let lb = lhs_layout.broadcast_as(&out_shape)?;
    let rb = rhs_layout.broadcast_as(&out_shape)?;
    let mut out = vec![0.0f32; out_shape.elem_count()];
    fork_join(cfg, &mut out, &|offset, piece| {
        let mut cur = Cursor::new(out_shape.dims(), [lb.strides(), rb.strides()], offset);
        for o in piece.iter_mut() {
            *o = op.apply(lhs[cur.pos[0]], rhs[cur.pos[1]]);
            cur.advance();
        }
    });
    Ok(out)
}

/// lhs = op(lhs, rhs) where rhs broadcasts into lhs's shape.
pub fn binary_inplace(
    cfg: &HostConfig,
    op: BinaryOp,
    lhs: &mut [f32],
    lhs_layout: &Layout,
    rhs: &[f32],
    rhs_layout: &Layout,
) -> Result<()> {
    let shape = lhs_layout.shape();
    let rb = rhs_layout.broadcast_as(shape)?;

    if !lhs_layout.is_contiguous() {
        // Writing through a permuted view: each storage slot is hit once.
        let mut rhs_positions = rb.strided_indices();
        for p in lhs_layout.strided_indices() {
            if let Some(q) = rhs_positions.next() {
                lhs[p] = op.apply(lhs[p], rhs[q]);
            }
        }
        return Ok(());
    }

    let n = shape.elem_count();
    let lhs = &mut lhs[..n];
    match plan(lhs_layout, rhs_layout, shape) {
        Plan::Same => fork_join(cfg, lhs, &|offset, piece| {
            let end = offset + piece.len();
            simd::zip_assign(piece, &rhs[offset..end], |a, b| op.apply(a, b));
        }),
        Plan::ScalarRhs => {
            let b = rhs[0];
            fork_join(cfg, lhs, &|_, piece| {
                for a in piece.iter_mut() {
                    *a = op.apply(*a, b);
                }
            })
        }
        Plan::RhsPattern(p) => fork_join(cfg, lhs, &|offset, piece| {
            for (k, a) in piece.iter_mut().enumerate() {
                *a = op.apply(*a, rhs[p.small_index(offset + k)]);
            }
        }),
        _ => fork_join(cfg, lhs, &|offset, piece| {
            let mut cur = Cursor::new(shape.dims(), [rb.strides()], offset);
            for a in piece.iter_mut() {
                *a = op.apply(*a, rhs[cur.pos[0]]);
                cur.advance();
            }
        }),
    }
    Ok(())
}

/// Sum `input` down to `target`, which must broadcast to the input's shape.
pub fn sum_to_shape(
    cfg: &HostConfig,
    input: &[f32],
    layout: &Layout,
    target: &Shape,
) -> Result<Vec<f32>> {
    let shape = layout.shape();
    if !target.broadcasts_into(shape) {
        return Err(Error::NotBroadcastable {
            lhs: shape.clone(),
            rhs: target.clone(),
        });
    }
    let n = shape.elem_count();

    if target.elem_count() == 1 {
        let total = if layout.is_contiguous() {
            let data = &input[..n];
            fork_join_sum(cfg, n, &|r| simd::sum(&data[r]))
        } else {
            layout.strided_indices().map(|p| input[p]).sum()
        };
        return Ok(vec![total]);
    }

    let mut out = vec![0.0f32; target.elem_count()];
    if layout.is_contiguous() {
        if let Some(p) = Pattern::detect(shape, target) {
            let outer = n / (p.batch * p.inner).max(1);
            for o in 0..outer {
                let dst = &mut out[o * p.inner..(o + 1) * p.inner];
                for b in 0..p.batch {
                    let start = (o * p.batch + b) * p.inner;
                    simd::axpy(1.0, &input[start..start + p.inner], dst);
                }
            }
            return Ok(out);
        }
    }

    // Output strides over the input index space: 0 on summed axes.
    let padded = target.padded_to(shape.rank());
    let target_layout = Layout::contiguous(padded.clone());
    let out_strides = padded.broadcast_strides(target_layout.strides(), shape)?;
    let mut cur = Cursor::new(shape.dims(), [layout.strides(), &out_strides], 0);
    for _ in 0..n {
        out[cur.pos[1]] += input[cur.pos[0]];
        cur.advance();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> HostConfig {
        HostConfig::sequential()
    }

    #[test]
    fn detects_fast_path_patterns() {
        let full = Shape::from((2, 3, 4));
        assert_eq!(
            Pattern::detect(&full, &Shape::from(4)),
            Some(Pattern { batch: 6, inner: 4 })
        );
        assert_eq!(
            Pattern::detect(&full, &Shape::from((3, 4))),
            Some(Pattern {
                batch: 2,
                inner: 12
            })
        );
        assert_eq!(
            Pattern::detect(&full, &Shape::from((2, 1, 4))),
            Some(Pattern { batch: 3, inner: 4 })
        );
        assert_eq!(Pattern::detect(&full, &Shape::from((2, 1, 1))).map(|p| p.inner), Some(1));
        assert_eq!(Pattern::detect(&full, &Shape::from((1, 3, 1))), None);
    }

    #[test]
    fn vector_broadcast_matches_generic() {
        let a: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let b = vec![10.0, 20.0, 30.0];
        let la = Layout::contiguous(Shape::from((2, 3)));
        let lb = Layout::contiguous(Shape::from(3));
        let fast = binary(&cfg(), BinaryOp::Add, &a, &la, &b, &lb).unwrap();
        let slow = binary_generic(&cfg(), BinaryOp::Add, &a, &la, &b, &lb).unwrap();
        assert_eq!(fast, vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
        assert_eq!(fast, slow);
    }

    #[test]
    fn lhs_broadcast_keeps_operand_order() {
        let a = vec![1.0, 2.0];
        let b = vec![10.0, 20.0, 30.0, 40.0];
        let la = Layout::contiguous(Shape::from(2));
        let lb = Layout::contiguous(Shape::from((2, 2)));
        let out = binary(&cfg(), BinaryOp::Sub, &a, &la, &b, &lb).unwrap();
        assert_eq!(out, vec![-9.0, -18.0, -29.0, -38.0]);
    }

    #[test]
    fn outer_product_uses_generic() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 10.0, 100.0];
        let la = Layout::contiguous(Shape::from((2, 1)));
        let lb = Layout::contiguous(Shape::from((1, 3)));
        assert_eq!(plan(&la, &lb, &Shape::from((2, 3))), Plan::Generic);
        let out = binary(&cfg(), BinaryOp::Mul, &a, &la, &b, &lb).unwrap();
        assert_eq!(out, vec![1.0, 10.0, 100.0, 2.0, 20.0, 200.0]);
    }

    #[test]
    fn inplace_into_transposed_view() {
        // storage [[1, 2], [3, 4]] viewed transposed
        let mut a = vec![1.0, 2.0, 3.0, 4.0];
        let view = Layout::contiguous(Shape::from((2, 2))).transpose(0, 1).unwrap();
        let b = vec![10.0, 20.0];
        let lb = Layout::contiguous(Shape::from(2));
        binary_inplace(&cfg(), BinaryOp::Add, &mut a, &view, &b, &lb).unwrap();
        // view row 0 = storage column 0 gets +10, +20 across the view's columns
        assert_eq!(a, vec![11.0, 12.0, 23.0, 24.0]);
    }

    #[test]
    fn sum_to_shape_reduces_broadcast_axes() {
        let x: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        let rows = sum_to_shape(&cfg(), &x, &layout, &Shape::from(4)).unwrap();
        assert_eq!(rows, vec![60.0, 66.0, 72.0, 78.0]);
        let mid = sum_to_shape(&cfg(), &x, &layout, &Shape::from((3, 1))).unwrap();
        assert_eq!(mid, vec![60.0, 92.0, 124.0]);
        let all = sum_to_shape(&cfg(), &x, &layout, &Shape::from(())).unwrap();
        assert_eq!(all, vec![276.0]);
    }
}
