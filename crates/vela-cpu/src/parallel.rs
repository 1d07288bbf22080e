// Host parallelism
//
// Two strategies, both on the rayon pool:
//
//   fork-join   element-wise maps: bisect the output with rayon::join until a
//               piece is at most `grain_size` long, then run it sequentially.
//   partition   row-structured work (matmul, softmax, conv): split the rows
//               into one contiguous block per worker up front.
//
// Work below `parallel_threshold` elements runs on the calling thread.

use std::ops::Range;

use rayon::prelude::*;

use crate::config::HostConfig;

/// Run `f(offset, piece)` over `out`, in parallel for large outputs.
/// `offset` is the index of `piece[0]` in `out`.
pub fn fork_join<F>(cfg: &HostConfig, out: &mut [f32], f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if !cfg.parallel(out.len()) {
        f(0, out);
        return;
    }
    bisect(out, 0, cfg.grain_size.max(1), f);
}

fn bisect<F>(out: &mut [f32], offset: usize, grain: usize, f: &F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if out.len() <= grain {
        f(offset, out);
        return;
    }
    let mid = out.len() / 2;
    let (left, right) = out.split_at_mut(mid);
    rayon::join(
        || bisect(left, offset, grain, f),
        || bisect(right, offset + mid, grain, f),
    );
}

/// Sum of `f(range)` over `0..n`, bisected like [`fork_join`].
pub fn fork_join_sum<F>(cfg: &HostConfig, n: usize, f: &F) -> f32
where
    F: Fn(Range<usize>) -> f32 + Sync,
{
    if !cfg.parallel(n) {
        return f(0..n);
    }
    bisect_sum(0..n, cfg.grain_size.max(1), f)
}

fn bisect_sum<F>(range: Range<usize>, grain: usize, f: &F) -> f32
where
    F: Fn(Range<usize>) -> f32 + Sync,
{
    if range.len() <= grain {
        return f(range);
    }
    let mid = range.start + range.len() / 2;
    let (a, b) = rayon::join(
        || bisect_sum(range.start..mid, grain, f),
        || bisect_sum(mid..range.end, grain, f),
    );
    a + b
}

/// Run `f(first_row, rows)` over `out` viewed as rows of `row_len`,
/// one block of rows per worker.
pub fn for_each_row_block<F>(cfg: &HostConfig, out: &mut [f32], row_len: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    if row_len == 0 || out.is_empty() {
        return;
    }
    let rows = out.len() / row_len;
    if !cfg.parallel(out.len()) || cfg.workers <= 1 || rows <= 1 {
        f(0, out);
        return;
    }
    let rows_per_block = rows.div_ceil(cfg.workers);
    out.par_chunks_mut(rows_per_block * row_len)
        .enumerate()
        .for_each(|(block, chunk)| f(block * rows_per_block, chunk));
}
