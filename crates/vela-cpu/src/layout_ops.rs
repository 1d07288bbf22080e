// Layout kernels: materialize, transpose, slice, slice accumulate, concat
//
// Slicing walks the resolved ranges recursively, one dimension per level.
// When the innermost range has unit step over a unit-stride dimension the
// last level is a single bulk copy instead of a per-element loop.

use std::borrow::Cow;

use vela_core::slice::ResolvedRange;
use vela_core::{Layout, Result, Shape};

use crate::broadcast::Cursor;
use crate::config::HostConfig;
use crate::parallel::{fork_join, for_each_row_block};
use crate::simd;

const TILE: usize = 32;

/// Borrow `data` if the layout is already row-major, copy otherwise.
pub fn contiguous<'a>(cfg: &HostConfig, data: &'a [f32], layout: &Layout) -> Cow<'a, [f32]> {
    if layout.is_contiguous() {
        Cow::Borrowed(&data[..layout.elem_count()])
    } else {
        Cow::Owned(materialize(cfg, data, layout))
    }
}

/// Row-major copy of the logical contents of `(data, layout)`.
pub fn materialize(cfg: &HostConfig, data: &[f32], layout: &Layout) -> Vec<f32> {
    let n = layout.elem_count();
    if layout.is_contiguous() {
        return data[..n].to_vec();
    }
    let mut out = vec![0.0f32; n];
    if layout.rank() == 2 && layout.strides()[0] == 1 {
        // A transposed matrix: storage holds [cols, rows] row-major.
        let (rows, cols) = (layout.dims()[0], layout.dims()[1]);
        transpose_2d(cfg, data, layout.strides()[1], rows, cols, &mut out);
        return out;
    }
    fork_join(cfg, &mut out, &|offset, piece| {
        let mut cur = Cursor::new(layout.dims(), [layout.strides()], offset);
        for o in piece.iter_mut() {
            *o = data[cur.pos[0]];
            cur.advance();
        }
    });
    out
}

/// out[i, j] = src[j·ld + i] for an output of `rows`×`cols`, in cache tiles.
pub fn transpose_2d(
    cfg: &HostConfig,
    src: &[f32],
    ld: usize,
    rows: usize,
    cols: usize,
    out: &mut [f32],
) {
    for_each_row_block(cfg, out, cols, |first_row, block| {
        let block_rows = block.len() / cols.max(1);
        for i0 in (0..block_rows).step_by(TILE) {
            for j0 in (0..cols).step_by(TILE) {
                for i in i0..(i0 + TILE).min(block_rows) {
                    let src_col = first_row + i;
                    let row = &mut block[i * cols..(i + 1) * cols];
                    for j in j0..(j0 + TILE).min(cols) {
                        row[j] = src[j * ld + src_col];
                    }
                }
            }
        }
    });
    debug_assert!(out.len() == rows * cols);
}

/// Copy out `ranges` of `(data, layout)` into a new row-major buffer.
pub fn slice(data: &[f32], layout: &Layout, ranges: &[ResolvedRange]) -> Vec<f32> {
    let count: usize = ranges.iter().map(|r| r.len).product();
    let mut out = Vec::with_capacity(count);
    if count == 0 {
        return out;
    }
    if ranges.is_empty() {
        out.push(data[0]);
        return out;
    }
    gather(data, layout.strides(), ranges, 0, 0, &mut out);
    out
}

fn gather(
    data: &[f32],
    strides: &[usize],
    ranges: &[ResolvedRange],
    dim: usize,
    base: usize,
    out: &mut Vec<f32>,
) {
    let r = ranges[dim];
    let stride = strides[dim];
    if dim + 1 == ranges.len() {
        if r.step == 1 && stride == 1 {
            let start = base + r.start;
            out.extend_from_slice(&data[start..start + r.len]);
        } else {
            out.extend((0..r.len).map(|i| data[base + r.source(i) * stride]));
        }
        return;
    }
    for i in 0..r.len {
        gather(data, strides, ranges, dim + 1, base + r.source(i) * stride, out);
    }
}

/// dst[ranges] += src, with dst row-major over `dst_shape`.
pub fn slice_accumulate(
    cfg: &HostConfig,
    dst: &mut [f32],
    dst_shape: &Shape,
    src: &[f32],
    src_layout: &Layout,
    ranges: &[ResolvedRange],
) -> Result<()> {
    let src = contiguous(cfg, src, src_layout);
    if src.is_empty() {
        return Ok(());
    }
    if ranges.is_empty() {
        dst[0] += src[0];
        return Ok(());
    }
    let strides = dst_shape.stride_contiguous();
    let mut read = 0;
    scatter_add(dst, &strides, ranges, 0, 0, &src, &mut read);
    Ok(())
}

fn scatter_add(
    dst: &mut [f32],
    strides: &[usize],
    ranges: &[ResolvedRange],
    dim: usize,
    base: usize,
    src: &[f32],
    read: &mut usize,
) {
    let r = ranges[dim];
    if dim + 1 == ranges.len() {
        let chunk = &src[*read..*read + r.len];
        if r.step == 1 {
            let start = base + r.start;
            simd::axpy(1.0, chunk, &mut dst[start..start + r.len]);
        } else {
            for (i, v) in chunk.iter().enumerate() {
                dst[base + r.source(i)] += v;
            }
        }
        *read += r.len;
        return;
    }
    for i in 0..r.len {
        let next = base + r.source(i) * strides[dim];
        scatter_add(dst, strides, ranges, dim + 1, next, src, read);
    }
}

/// Concatenate along `dim`. Shapes were validated by the caller.
pub fn concat(
    cfg: &HostConfig,
    inputs: &[(&[f32], &Layout)],
    out_shape: &Shape,
    dim: usize,
) -> Vec<f32> {
    let dims = out_shape.dims();
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();
    let parts: Vec<(Cow<'_, [f32]>, usize)> = inputs
        .iter()
        .map(|(data, layout)| (contiguous(cfg, data, layout), layout.dims()[dim] * inner))
        .collect();
    let mut out = Vec::with_capacity(out_shape.elem_count());
    for o in 0..outer {
        for (data, block) in &parts {
            out.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_core::slice::resolve_ranges;
    use vela_core::SliceRange;

    fn grid(rows: usize, cols: usize) -> (Vec<f32>, Layout) {
        let data = (0..rows * cols).map(|i| i as f32).collect();
        (data, Layout::contiguous(Shape::from((rows, cols))))
    }

    #[test]
    fn materialize_transposed_matches_strided_walk() {
        let (data, layout) = grid(37, 45);
        let t = layout.transpose(0, 1).unwrap();
        let cfg = HostConfig::default().with_parallel_threshold(0).with_workers(4);
        let fast = materialize(&cfg, &data, &t);
        let walk: Vec<f32> = t.strided_indices().map(|p| data[p]).collect();
        assert_eq!(fast, walk);
    }

    #[test]
    fn slice_columns() {
        let (data, layout) = grid(4, 4);
        let ranges = resolve_ranges(
            layout.shape(),
            &[SliceRange::all(), SliceRange::interval(1, 3)],
        )
        .unwrap();
        let out = slice(&data, &layout, &ranges);
        assert_eq!(out, vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0, 13.0, 14.0]);
    }

    #[test]
    fn stepped_slice_of_transposed_view() {
        let (data, layout) = grid(2, 3);
        let t = layout.transpose(0, 1).unwrap(); // [[0,3],[1,4],[2,5]]
        let ranges = resolve_ranges(t.shape(), &[SliceRange::stepped(0, 3, 2)]).unwrap();
        assert_eq!(slice(&data, &t, &ranges), vec![0.0, 3.0, 2.0, 5.0]);
    }

    #[test]
    fn accumulate_adds_into_existing_values() {
        let shape = Shape::from((3, 3));
        let mut dst = vec![1.0f32; 9];
        let src = vec![10.0, 20.0];
        let src_layout = Layout::contiguous(Shape::from((2, 1)));
        let ranges = resolve_ranges(&shape, &[SliceRange::interval(1, 3), SliceRange::index(2)])
            .unwrap();
        let cfg = HostConfig::sequential();
        slice_accumulate(&cfg, &mut dst, &shape, &src, &src_layout, &ranges).unwrap();
        slice_accumulate(&cfg, &mut dst, &shape, &src, &src_layout, &ranges).unwrap();
        assert_eq!(dst, vec![1.0, 1.0, 1.0, 1.0, 1.0, 21.0, 1.0, 1.0, 41.0]);
    }

    #[test]
    fn concat_middle_axis() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0];
        let la = Layout::contiguous(Shape::from((2, 2)));
        let lb = Layout::contiguous(Shape::from((2, 1)));
        let out = concat(
            &HostConfig::sequential(),
            &[(a.as_slice(), &la), (b.as_slice(), &lb)],
            &Shape::from((2, 3)),
            1,
        );
        assert_eq!(out, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
    }
}
