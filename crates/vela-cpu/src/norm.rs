// Row-wise kernels over the last axis: softmax, layer normalization and
// their backward passes. Rows are split across workers.

use vela_core::{Layout, Result};

use crate::config::HostConfig;
use crate::layout_ops::contiguous;
use crate::parallel::for_each_row_block;
use crate::simd;

fn row_len(layout: &Layout) -> usize {
    layout.dims().last().copied().unwrap_or(1)
}

/// Softmax along the last axis. A row that is entirely −∞ becomes zeros.
pub fn softmax(cfg: &HostConfig, input: &[f32], layout: &Layout) -> Result<Vec<f32>> {
    let x = contiguous(cfg, input, layout);
    let d = row_len(layout);
    let mut out = vec![0.0f32; x.len()];
    for_each_row_block(cfg, &mut out, d, |first, rows| {
        for (r, y) in rows.chunks_mut(d).enumerate() {
            let row = &x[(first + r) * d..(first + r + 1) * d];
            softmax_row(row, y);
        }
    });
    Ok(out)
}

fn softmax_row(x: &[f32], y: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        y.fill(0.0);
        return;
    }
    let mut sum = 0.0f32;
    for (o, &v) in y.iter_mut().zip(x) {
        *o = (v - max).exp();
        sum += *o;
    }
    let inv = 1.0 / sum;
    for o in y.iter_mut() {
        *o *= inv;
    }
}

/// y·(g − Σ g·y) per row.
pub fn softmax_backward(
    cfg: &HostConfig,
    output: &[f32],
    output_layout: &Layout,
    grad: &[f32],
    grad_layout: &Layout,
) -> Result<Vec<f32>> {
    let y = contiguous(cfg, output, output_layout);
    let g = contiguous(cfg, grad, grad_layout);
    let d = row_len(output_layout);
    let mut out = vec![0.0f32; y.len()];
    for_each_row_block(cfg, &mut out, d, |first, rows| {
        for (r, dx) in rows.chunks_mut(d).enumerate() {
            let span = (first + r) * d..(first + r + 1) * d;
            let (yr, gr) = (&y[span.clone()], &g[span]);
            let dot = simd::dot(yr, gr);
            simd::zip_map(yr, gr, dx, |yv, gv| yv * (gv - dot));
        }
    });
    Ok(out)
}

fn moments(row: &[f32], eps: f32) -> (f32, f32) {
    let n = row.len().max(1) as f32;
    let mean = simd::sum(row) / n;
    let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, 1.0 / (var + eps).sqrt())
}

/// (x − mean) / √(var + eps) per row, population variance.
pub fn layer_norm(cfg: &HostConfig, input: &[f32], layout: &Layout, eps: f32) -> Result<Vec<f32>> {
    let x = contiguous(cfg, input, layout);
    let d = row_len(layout);
    let mut out = vec![0.0f32; x.len()];
    for_each_row_block(cfg, &mut out, d, |first, rows| {
        for (r, y) in rows.chunks_mut(d).enumerate() {
            let row = &x[(first + r) * d..(first + r + 1) * d];
            let (mean, inv_std) = moments(row, eps);
            simd::map(row, y, |v| (v - mean) * inv_std);
        }
    });
    Ok(out)
}

/// dx = inv_std · (g − mean(g) − x̂·mean(g·x̂)), with g the gradient of x̂.
pub fn layer_norm_backward(
    cfg: &HostConfig,
    input: &[f32],
    input_layout: &Layout,
    grad: &[f32],
    grad_layout: &Layout,
    eps: f32,
) -> Result<Vec<f32>> {
    let x = contiguous(cfg, input, input_layout);
    let g = contiguous(cfg, grad, grad_layout);
    let d = row_len(input_layout);
    let mut out = vec![0.0f32; x.len()];
    for_each_row_block(cfg, &mut out, d, |first, rows| {
        let mut xhat = vec![0.0f32; d];
        for (r, dx) in rows.chunks_mut(d).enumerate() {
            let span = (first + r) * d..(first + r + 1) * d;
            let (xr, gr) = (&x[span.clone()], &g[span]);
            let (mean, inv_std) = moments(xr, eps);
            simd::map(xr, &mut xhat, |v| (v - mean) * inv_std);
            let n = d as f32;
            let g_mean = simd::sum(gr) / n;
            let gx_mean = simd::dot(gr, &xhat) / n;
            simd::zip_map(gr, &xhat, dx, |gv, xv| inv_std * (gv - g_mean - xv * gx_mean));
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_core::Shape;

    fn rows(d: usize, data: &[f32]) -> Layout {
        Layout::contiguous(Shape::from((data.len() / d, d)))
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0];
        let y = softmax(&HostConfig::sequential(), &x, &rows(3, &x)).unwrap();
        for r in y.chunks(3) {
            assert!((r.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert!((y[5] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fully_masked_row_is_zero() {
        let ninf = f32::NEG_INFINITY;
        let x = vec![ninf, ninf, 0.0, ninf];
        let y = softmax(&HostConfig::sequential(), &x, &rows(2, &x)).unwrap();
        assert_eq!(y, vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn layer_norm_zero_mean_unit_variance() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = layer_norm(&HostConfig::sequential(), &x, &rows(4, &x), 0.0).unwrap();
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        let var: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
    }

    #[test]
    fn layer_norm_backward_matches_finite_differences() {
        let x = vec![0.3, -1.2, 2.0, 0.7];
        let g = vec![0.5, -0.25, 1.0, 2.0];
        let layout = rows(4, &x);
        let cfg = HostConfig::sequential();
        let eps = 1e-5;
        let dx = layer_norm_backward(&cfg, &x, &layout, &g, &layout, eps).unwrap();
        let h = 1e-3;
        for i in 0..4 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[i] += h;
            xm[i] -= h;
            let fp: f32 = layer_norm(&cfg, &xp, &layout, eps)
                .unwrap()
                .iter()
                .zip(&g)
                .map(|(a, b)| a * b)
                .sum();
            let fm: f32 = layer_norm(&cfg, &xm, &layout, eps)
                .unwrap()
                .iter()
                .zip(&g)
                .map(|(a, b)| a * b)
                .sum();
            let numeric = (fp - fm) / (2.0 * h);
            assert!((dx[i] - numeric).abs() < 1e-2, "{i}: {} vs {numeric}", dx[i]);
        }
    }
}
