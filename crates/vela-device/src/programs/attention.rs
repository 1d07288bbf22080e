// Flash attention kernels
//
// Forward: one work item per (query row, batch). Keys are consumed in tiles
// of `tile`; a running max `m`, normalizer `l` and unnormalized output are
// rescaled whenever a tile raises the max (online softmax), so the
// [seq_q, seq_k] score matrix is never stored. The per-row log-sum-exp
// m + ln(l) is written for the backward pass. A row with no visible key
// produces zeros and lse = −∞.
//
// Backward recomputes P = exp(s − lse) from Q, K and the saved lse:
//
//   delta_i = Σ_d dO_i·O_i
//   dQ_i    = scale · Σ_j P_ij (dO_i·V_j − delta_i) K_j     (per query row)
//   dV_j    = Σ_i P_ij dO_i                                 (per key row)
//   dK_j    = scale · Σ_i P_ij (dO_i·V_j − delta_i) Q_i     (per key row)
//
// Splitting dQ from dK/dV keeps every work item the only writer of its row.

use vela_core::AttentionParams;

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, Cells, WorkItem};

use super::dot;

// The CUDA kernels keep their running row in the output row itself, so no
// per-thread array is sized by head_dim.
const SOURCE: &str = r#"
__device__ __forceinline__ bool visible(int causal, int i, int j, int seq_q, int seq_k) {
    return !causal || j + seq_q <= i + seq_k;
}

extern "C" __global__ void flash_attention_forward(const float* q, const float* k, const float* v,
                                                   float* out, float* lse,
                                                   int batch, int seq_q, int seq_k, int head_dim,
                                                   float scale, int causal, int tile) {
    int i = global_x();
    int b = global_y();
    if (i >= seq_q || b >= batch) return;
    if (tile < 1) tile = 1;
    int qo = (b * seq_q + i) * head_dim;
    float* acc = out + qo;
    for (int c = 0; c < head_dim; ++c) acc[c] = 0.0f;

    float m = NEG_INF;
    float l = 0.0f;
    for (int start = 0; start < seq_k; start += tile) {
        int end = min(start + tile, seq_k);
        float tile_max = NEG_INF;
        for (int j = start; j < end; ++j) {
            if (!visible(causal, i, j, seq_q, seq_k)) continue;
            float s = scale * row_dot(q, qo, k, (b * seq_k + j) * head_dim, head_dim);
            tile_max = fmaxf(tile_max, s);
        }
        float m_new = fmaxf(m, tile_max);
        if (m_new == NEG_INF) continue;
        float correction = expf(m - m_new);
        l *= correction;
        for (int c = 0; c < head_dim; ++c) acc[c] *= correction;
        for (int j = start; j < end; ++j) {
            if (!visible(causal, i, j, seq_q, seq_k)) continue;
            int ko = (b * seq_k + j) * head_dim;
            float p = expf(scale * row_dot(q, qo, k, ko, head_dim) - m_new);
            l += p;
            for (int c = 0; c < head_dim; ++c) acc[c] += p * v[ko + c];
        }
        m = m_new;
    }

    int row = b * seq_q + i;
    if (l == 0.0f) {
        for (int c = 0; c < head_dim; ++c) acc[c] = 0.0f;
        lse[row] = NEG_INF;
        return;
    }
    float inv = 1.0f / l;
    for (int c = 0; c < head_dim; ++c) acc[c] *= inv;
    lse[row] = m + logf(l);
}

extern "C" __global__ void flash_attention_backward_delta(const float* out, const float* grad,
                                                          float* delta, int rows, int head_dim) {
    int row = global_x();
    if (row >= rows) return;
    delta[row] = row_dot(out, row * head_dim, grad, row * head_dim, head_dim);
}

extern "C" __global__ void flash_attention_backward_dq(const float* q, const float* k, const float* v,
                                                       const float* grad, const float* lse,
                                                       const float* delta, float* dq,
                                                       int batch, int seq_q, int seq_k, int head_dim,
                                                       float scale, int causal, int tile) {
    int i = global_x();
    int b = global_y();
    if (i >= seq_q || b >= batch) return;
    int row = b * seq_q + i;
    int qo = row * head_dim;
    float* acc = dq + qo;
    for (int c = 0; c < head_dim; ++c) acc[c] = 0.0f;
    float row_lse = lse[row];
    if (row_lse == NEG_INF) return;
    float row_delta = delta[row];
    for (int j = 0; j < seq_k; ++j) {
        if (!visible(causal, i, j, seq_q, seq_k)) continue;
        int ko = (b * seq_k + j) * head_dim;
        float p = expf(scale * row_dot(q, qo, k, ko, head_dim) - row_lse);
        float ds = p * (row_dot(grad, qo, v, ko, head_dim) - row_delta);
        for (int c = 0; c < head_dim; ++c) acc[c] += ds * k[ko + c];
    }
    for (int c = 0; c < head_dim; ++c) acc[c] *= scale;
}

extern "C" __global__ void flash_attention_backward_dkdv(const float* q, const float* k, const float* v,
                                                         const float* grad, const float* lse,
                                                         const float* delta, float* dk, float* dv,
                                                         int batch, int seq_q, int seq_k, int head_dim,
                                                         float scale, int causal, int tile) {
    int j = global_x();
    int b = global_y();
    if (j >= seq_k || b >= batch) return;
    int ko = (b * seq_k + j) * head_dim;
    float* dk_row = dk + ko;
    float* dv_row = dv + ko;
    for (int c = 0; c < head_dim; ++c) {
        dk_row[c] = 0.0f;
        dv_row[c] = 0.0f;
    }
    for (int i = 0; i < seq_q; ++i) {
        if (!visible(causal, i, j, seq_q, seq_k)) continue;
        int row = b * seq_q + i;
        float row_lse = lse[row];
        if (row_lse == NEG_INF) continue;
        int qo = row * head_dim;
        float p = expf(scale * row_dot(q, qo, k, ko, head_dim) - row_lse);
        float ds = p * (row_dot(grad, qo, v, ko, head_dim) - delta[row]);
        for (int c = 0; c < head_dim; ++c) {
            dv_row[c] += p * grad[qo + c];
            dk_row[c] += ds * q[qo + c];
        }
    }
    for (int c = 0; c < head_dim; ++c) dk_row[c] *= scale;
}
"#;

const SHAPE_PARAMS: [Param; 7] = [
    Param::int("batch"),
    Param::int("seq_q"),
    Param::int("seq_k"),
    Param::int("head_dim"),
    Param::float("scale"),
    Param::int("causal"),
    Param::int("tile"),
];

pub static PROGRAM: Program = Program {
    path: "kernels/attention",
    source: SOURCE,
    kernels: &[
        KernelDef {
            name: "flash_attention_forward",
            params: &[
                Param::buffer("q"),
                Param::buffer("k"),
                Param::buffer("v"),
                Param::buffer("out"),
                Param::buffer("lse"),
                SHAPE_PARAMS[0],
                SHAPE_PARAMS[1],
                SHAPE_PARAMS[2],
                SHAPE_PARAMS[3],
                SHAPE_PARAMS[4],
                SHAPE_PARAMS[5],
                SHAPE_PARAMS[6],
            ],
            emulated: forward,
        },
        KernelDef {
            name: "flash_attention_backward_delta",
            params: &[
                Param::buffer("out"),
                Param::buffer("grad"),
                Param::buffer("delta"),
                Param::int("rows"),
                Param::int("head_dim"),
            ],
            emulated: backward_delta,
        },
        KernelDef {
            name: "flash_attention_backward_dq",
            params: &[
                Param::buffer("q"),
                Param::buffer("k"),
                Param::buffer("v"),
                Param::buffer("grad"),
                Param::buffer("lse"),
                Param::buffer("delta"),
                Param::buffer("dq"),
                SHAPE_PARAMS[0],
                SHAPE_PARAMS[1],
                SHAPE_PARAMS[2],
                SHAPE_PARAMS[3],
                SHAPE_PARAMS[4],
                SHAPE_PARAMS[5],
                SHAPE_PARAMS[6],
            ],
            emulated: backward_dq,
        },
        KernelDef {
            name: "flash_attention_backward_dkdv",
            params: &[
                Param::buffer("q"),
                Param::buffer("k"),
                Param::buffer("v"),
                Param::buffer("grad"),
                Param::buffer("lse"),
                Param::buffer("delta"),
                Param::buffer("dk"),
                Param::buffer("dv"),
                SHAPE_PARAMS[0],
                SHAPE_PARAMS[1],
                SHAPE_PARAMS[2],
                SHAPE_PARAMS[3],
                SHAPE_PARAMS[4],
                SHAPE_PARAMS[5],
                SHAPE_PARAMS[6],
            ],
            emulated: backward_dkdv,
        },
    ],
};

/// Problem shape read from the seven trailing arguments starting at `first`.
struct Dims {
    batch: usize,
    seq_q: usize,
    seq_k: usize,
    d: usize,
    tile: usize,
    params: AttentionParams,
}

impl Dims {
    fn read(a: &Args<'_>, first: usize) -> Access<Self> {
        Ok(Dims {
            batch: a.usize(first)?,
            seq_q: a.usize(first + 1)?,
            seq_k: a.usize(first + 2)?,
            d: a.usize(first + 3)?,
            params: AttentionParams {
                scale: a.float(first + 4)?,
                causal: a.int(first + 5)? != 0,
            },
            tile: a.usize(first + 6)?.max(1),
        })
    }

    fn q_row(&self, b: usize, i: usize) -> usize {
        (b * self.seq_q + i) * self.d
    }

    fn k_row(&self, b: usize, j: usize) -> usize {
        (b * self.seq_k + j) * self.d
    }

    fn visible(&self, i: usize, j: usize) -> bool {
        self.params.visible(i, j, self.seq_q, self.seq_k)
    }
}

fn store_row(buf: &Cells, offset: usize, values: &[f32]) -> Access<()> {
    for (p, &v) in values.iter().enumerate() {
        buf.store(offset + p, v)?;
    }
    Ok(())
}

fn forward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let g = Dims::read(a, 5)?;
    let (i, b) = (item.id(0), item.id(1));
    if i >= g.seq_q || b >= g.batch {
        return Ok(());
    }
    let (q, k, v) = (a.buffer(0)?, a.buffer(1)?, a.buffer(2)?);
    let qo = g.q_row(b, i);

    let mut m = f32::NEG_INFINITY;
    let mut l = 0.0f32;
    let mut acc = vec![0.0f32; g.d];
    let mut scores = Vec::with_capacity(g.tile);
    for start in (0..g.seq_k).step_by(g.tile) {
        let end = (start + g.tile).min(g.seq_k);
        scores.clear();
        let mut tile_max = f32::NEG_INFINITY;
        for j in start..end {
            let s = if g.visible(i, j) {
                g.params.scale * dot(q, qo, k, g.k_row(b, j), g.d)?
            } else {
                f32::NEG_INFINITY
            };
            tile_max = tile_max.max(s);
            scores.push(s);
        }
        let m_new = m.max(tile_max);
        if m_new == f32::NEG_INFINITY {
            continue;
        }
        let correction = (m - m_new).exp();
        l *= correction;
        acc.iter_mut().for_each(|x| *x *= correction);
        for (t, &s) in scores.iter().enumerate() {
            if s == f32::NEG_INFINITY {
                continue;
            }
            let p = (s - m_new).exp();
            l += p;
            let vo = g.k_row(b, start + t);
            for (c, x) in acc.iter_mut().enumerate() {
                *x += p * v.load(vo + c)?;
            }
        }
        m = m_new;
    }

    let row = b * g.seq_q + i;
    if l == 0.0 {
        store_row(a.buffer(3)?, qo, &vec![0.0; g.d])?;
        return a.buffer(4)?.store(row, f32::NEG_INFINITY);
    }
    let inv = 1.0 / l;
    acc.iter_mut().for_each(|x| *x *= inv);
    store_row(a.buffer(3)?, qo, &acc)?;
    a.buffer(4)?.store(row, m + l.ln())
}

fn backward_delta(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let row = item.id(0);
    if row >= a.usize(3)? {
        return Ok(());
    }
    let d = a.usize(4)?;
    let delta = dot(a.buffer(0)?, row * d, a.buffer(1)?, row * d, d)?;
    a.buffer(2)?.store(row, delta)
}

/// P_ij and dP_ij − delta_i for one visible (query, key) pair.
#[allow(clippy::too_many_arguments)]
fn weight_and_ds(
    g: &Dims,
    q: &Cells,
    k: &Cells,
    v: &Cells,
    grad: &Cells,
    lse: f32,
    delta: f32,
    b: usize,
    i: usize,
    j: usize,
) -> Access<(f32, f32)> {
    let (qo, ko) = (g.q_row(b, i), g.k_row(b, j));
    let s = g.params.scale * dot(q, qo, k, ko, g.d)?;
    let p = (s - lse).exp();
    let dp = dot(grad, qo, v, ko, g.d)?;
    Ok((p, p * (dp - delta)))
}

fn backward_dq(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let g = Dims::read(a, 7)?;
    let (i, b) = (item.id(0), item.id(1));
    if i >= g.seq_q || b >= g.batch {
        return Ok(());
    }
    let (q, k, v, grad) = (a.buffer(0)?, a.buffer(1)?, a.buffer(2)?, a.buffer(3)?);
    let row = b * g.seq_q + i;
    let lse = a.buffer(4)?.load(row)?;
    let delta = a.buffer(5)?.load(row)?;
    let mut dq = vec![0.0f32; g.d];
    if lse != f32::NEG_INFINITY {
        for start in (0..g.seq_k).step_by(g.tile) {
            for j in start..(start + g.tile).min(g.seq_k) {
                if !g.visible(i, j) {
                    continue;
                }
                let (_, ds) = weight_and_ds(&g, q, k, v, grad, lse, delta, b, i, j)?;
                let ko = g.k_row(b, j);
                for (c, x) in dq.iter_mut().enumerate() {
                    *x += ds * k.load(ko + c)?;
                }
            }
        }
    }
    dq.iter_mut().for_each(|x| *x *= g.params.scale);
    store_row(a.buffer(6)?, g.q_row(b, i), &dq)
}

fn backward_dkdv(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let g = Dims::read(a, 8)?;
    let (j, b) = (item.id(0), item.id(1));
    if j >= g.seq_k || b >= g.batch {
        return Ok(());
    }
    let (q, k, v, grad) = (a.buffer(0)?, a.buffer(1)?, a.buffer(2)?, a.buffer(3)?);
    let (lse_buf, delta_buf) = (a.buffer(4)?, a.buffer(5)?);
    let mut dk = vec![0.0f32; g.d];
    let mut dv = vec![0.0f32; g.d];
    for start in (0..g.seq_q).step_by(g.tile) {
        for i in start..(start + g.tile).min(g.seq_q) {
            if !g.visible(i, j) {
                continue;
            }
            let row = b * g.seq_q + i;
            let lse = lse_buf.load(row)?;
            if lse == f32::NEG_INFINITY {
                continue;
            }
            let (p, ds) = weight_and_ds(&g, q, k, v, grad, lse, delta_buf.load(row)?, b, i, j)?;
            let qo = g.q_row(b, i);
            for c in 0..g.d {
                dv[c] += p * grad.load(qo + c)?;
                dk[c] += ds * q.load(qo + c)?;
            }
        }
    }
    dk.iter_mut().for_each(|x| *x *= g.params.scale);
    let ko = g.k_row(b, j);
    store_row(a.buffer(6)?, ko, &dk)?;
    store_row(a.buffer(7)?, ko, &dv)
}
