// Row kernels over the last axis, one work item per row.

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, Cells, WorkItem};

const SOURCE: &str = r#"
extern "C" __global__ void softmax(const float* x, float* out, int rows, int cols) {
    int row = global_x();
    if (row >= rows) return;
    int base = row * cols;
    float max = NEG_INF;
    for (int j = 0; j < cols; ++j) max = fmaxf(max, x[base + j]);
    if (max == NEG_INF) {
        for (int j = 0; j < cols; ++j) out[base + j] = 0.0f;
        return;
    }
    float sum = 0.0f;
    for (int j = 0; j < cols; ++j) {
        float e = expf(x[base + j] - max);
        out[base + j] = e;
        sum += e;
    }
    float inv = 1.0f / sum;
    for (int j = 0; j < cols; ++j) out[base + j] *= inv;
}

extern "C" __global__ void softmax_backward(const float* y, const float* grad, float* out,
                                            int rows, int cols) {
    int row = global_x();
    if (row >= rows) return;
    int base = row * cols;
    float dot = row_dot(y, base, grad, base, cols);
    for (int j = 0; j < cols; ++j) out[base + j] = y[base + j] * (grad[base + j] - dot);
}

__device__ void row_moments(const float* x, int base, int cols, float eps, float* mean, float* inv_std) {
    float n = (float)max(cols, 1);
    float m = 0.0f;
    for (int j = 0; j < cols; ++j) m += x[base + j];
    m /= n;
    float var = 0.0f;
    for (int j = 0; j < cols; ++j) {
        float d = x[base + j] - m;
        var += d * d;
    }
    *mean = m;
    *inv_std = rsqrtf(var / n + eps);
}

extern "C" __global__ void layer_norm(const float* x, float* out, int rows, int cols, float eps) {
    int row = global_x();
    if (row >= rows) return;
    int base = row * cols;
    float mean, inv_std;
    row_moments(x, base, cols, eps, &mean, &inv_std);
    for (int j = 0; j < cols; ++j) out[base + j] = (x[base + j] - mean) * inv_std;
}

extern "C" __global__ void layer_norm_backward(const float* x, const float* grad, float* out,
                                               int rows, int cols, float eps) {
    int row = global_x();
    if (row >= rows) return;
    int base = row * cols;
    float mean, inv_std;
    row_moments(x, base, cols, eps, &mean, &inv_std);
    float n = (float)max(cols, 1);
    float g_mean = 0.0f, gx_mean = 0.0f;
    for (int j = 0; j < cols; ++j) {
        float g = grad[base + j];
        g_mean += g;
        gx_mean += g * (x[base + j] - mean) * inv_std;
    }
    g_mean /= n;
    gx_mean /= n;
    for (int j = 0; j < cols; ++j) {
        float xhat = (x[base + j] - mean) * inv_std;
        out[base + j] = inv_std * (grad[base + j] - g_mean - xhat * gx_mean);
    }
}
"#;

const ROW_PARAMS: &[Param] = &[
    Param::buffer("x"),
    Param::buffer("out"),
    Param::int("rows"),
    Param::int("cols"),
];

const ROW_GRAD_PARAMS: &[Param] = &[
    Param::buffer("x"),
    Param::buffer("grad"),
    Param::buffer("out"),
    Param::int("rows"),
    Param::int("cols"),
];

pub static PROGRAM: Program = Program {
    path: "kernels/norm",
    source: SOURCE,
    kernels: &[
        KernelDef {
            name: "softmax",
            params: ROW_PARAMS,
            emulated: softmax,
        },
        KernelDef {
            name: "softmax_backward",
            params: ROW_GRAD_PARAMS,
            emulated: softmax_backward,
        },
        KernelDef {
            name: "layer_norm",
            params: &[
                Param::buffer("x"),
                Param::buffer("out"),
                Param::int("rows"),
                Param::int("cols"),
                Param::float("eps"),
            ],
            emulated: layer_norm,
        },
        KernelDef {
            name: "layer_norm_backward",
            params: &[
                Param::buffer("x"),
                Param::buffer("grad"),
                Param::buffer("out"),
                Param::int("rows"),
                Param::int("cols"),
                Param::float("eps"),
            ],
            emulated: layer_norm_backward,
        },
    ],
};

fn load_row(buf: &Cells, row: usize, cols: usize) -> Access<Vec<f32>> {
    (row * cols..(row + 1) * cols).map(|i| buf.load(i)).collect()
}

fn store_row(buf: &Cells, row: usize, values: &[f32]) -> Access<()> {
    let base = row * values.len();
    for (j, &v) in values.iter().enumerate() {
        buf.store(base + j, v)?;
    }
    Ok(())
}

/// A row of all −∞ becomes zeros.
fn softmax(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let row = item.id(0);
    if row >= a.usize(2)? {
        return Ok(());
    }
    let cols = a.usize(3)?;
    let mut x = load_row(a.buffer(0)?, row, cols)?;
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        x.fill(0.0);
    } else {
        let mut sum = 0.0f32;
        for v in x.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        let inv = 1.0 / sum;
        x.iter_mut().for_each(|v| *v *= inv);
    }
    store_row(a.buffer(1)?, row, &x)
}

fn softmax_backward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let row = item.id(0);
    if row >= a.usize(3)? {
        return Ok(());
    }
    let cols = a.usize(4)?;
    let y = load_row(a.buffer(0)?, row, cols)?;
    let g = load_row(a.buffer(1)?, row, cols)?;
    let dot: f32 = y.iter().zip(&g).map(|(yv, gv)| yv * gv).sum();
    let dx: Vec<f32> = y.iter().zip(&g).map(|(yv, gv)| yv * (gv - dot)).collect();
    store_row(a.buffer(2)?, row, &dx)
}

fn moments(row: &[f32], eps: f32) -> (f32, f32) {
    let n = row.len().max(1) as f32;
    let mean = row.iter().sum::<f32>() / n;
    let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, 1.0 / (var + eps).sqrt())
}

fn layer_norm(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let row = item.id(0);
    if row >= a.usize(2)? {
        return Ok(());
    }
    let cols = a.usize(3)?;
    let x = load_row(a.buffer(0)?, row, cols)?;
    let (mean, inv_std) = moments(&x, a.float(4)?);
    let y: Vec<f32> = x.iter().map(|v| (v - mean) * inv_std).collect();
    store_row(a.buffer(1)?, row, &y)
}

fn layer_norm_backward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let row = item.id(0);
    if row >= a.usize(3)? {
        return Ok(());
    }
    let cols = a.usize(4)?;
    let x = load_row(a.buffer(0)?, row, cols)?;
    let g = load_row(a.buffer(1)?, row, cols)?;
    let (mean, inv_std) = moments(&x, a.float(5)?);
    let n = cols.max(1) as f32;
    let xhat: Vec<f32> = x.iter().map(|v| (v - mean) * inv_std).collect();
    let g_mean = g.iter().sum::<f32>() / n;
    let gx_mean = g.iter().zip(&xhat).map(|(gv, xv)| gv * xv).sum::<f32>() / n;
    let dx: Vec<f32> = g
        .iter()
        .zip(&xhat)
        .map(|(gv, xv)| inv_std * (gv - g_mean - xv * gx_mean))
        .collect();
    store_row(a.buffer(2)?, row, &dx)
}
