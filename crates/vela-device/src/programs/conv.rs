// Convolution and max-pool kernels over NCHW data.
//
// Geometry is packed into one index buffer so each kernel keeps a short
// argument list:
//
//   conv:  [n, c_in, h, w, c_out, kh, kw, oh, ow, sh, sw, ph, pw]
//   pool:  [n, c, h, w, kh, kw, oh, ow, sh, sw]
//
// All passes are gathers (one work item per written element), so no two
// items touch the same output slot. Pool backward recomputes each window's
// argmax; ties go to the first maximum in row-major window order.

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, Cells, WorkItem};

use super::read_indices;

pub const CONV_GEOMETRY_LEN: usize = 13;
pub const POOL_GEOMETRY_LEN: usize = 10;

const SOURCE: &str = r#"
// input coordinate read by output `o` at tap `t`, or -1 in the padding
__device__ __forceinline__ int conv_source(int o, int t, int stride, int pad, int size) {
    int p = o * stride + t - pad;
    return (p >= 0 && p < size) ? p : -1;
}

// output coordinate reading input `i` at tap `t`, or -1
__device__ __forceinline__ int conv_target(int i, int t, int stride, int pad, int size) {
    int v = i + pad - t;
    if (v < 0 || v % stride != 0) return -1;
    int o = v / stride;
    return o < size ? o : -1;
}

extern "C" __global__ void conv2d(const float* input, const float* weight, float* out,
                                  const int* g, int total) {
    int i = global_x();
    if (i >= total) return;
    int c = g[1], h = g[2], w = g[3], o = g[4], kh = g[5], kw = g[6];
    int oh = g[7], ow = g[8], sh = g[9], sw = g[10], ph = g[11], pw = g[12];
    int ox = i % ow;
    int oy = (i / ow) % oh;
    int co = (i / (ow * oh)) % o;
    int b = i / (ow * oh * o);
    float acc = 0.0f;
    for (int ci = 0; ci < c; ++ci) {
        for (int ky = 0; ky < kh; ++ky) {
            int iy = conv_source(oy, ky, sh, ph, h);
            if (iy < 0) continue;
            for (int kx = 0; kx < kw; ++kx) {
                int ix = conv_source(ox, kx, sw, pw, w);
                if (ix < 0) continue;
                acc += input[((b * c + ci) * h + iy) * w + ix]
                     * weight[((co * c + ci) * kh + ky) * kw + kx];
            }
        }
    }
    out[i] = acc;
}

extern "C" __global__ void conv2d_backward_input(const float* grad, const float* weight, float* out,
                                                 const int* g, int total) {
    int i = global_x();
    if (i >= total) return;
    int c = g[1], h = g[2], w = g[3], o = g[4], kh = g[5], kw = g[6];
    int oh = g[7], ow = g[8], sh = g[9], sw = g[10], ph = g[11], pw = g[12];
    int ix = i % w;
    int iy = (i / w) % h;
    int ci = (i / (w * h)) % c;
    int b = i / (w * h * c);
    float acc = 0.0f;
    for (int co = 0; co < o; ++co) {
        for (int ky = 0; ky < kh; ++ky) {
            int oy = conv_target(iy, ky, sh, ph, oh);
            if (oy < 0) continue;
            for (int kx = 0; kx < kw; ++kx) {
                int ox = conv_target(ix, kx, sw, pw, ow);
                if (ox < 0) continue;
                acc += grad[((b * o + co) * oh + oy) * ow + ox]
                     * weight[((co * c + ci) * kh + ky) * kw + kx];
            }
        }
    }
    out[i] = acc;
}

extern "C" __global__ void conv2d_backward_weight(const float* grad, const float* input, float* out,
                                                  const int* g, int total) {
    int i = global_x();
    if (i >= total) return;
    int n = g[0], c = g[1], h = g[2], w = g[3], o = g[4], kh = g[5], kw = g[6];
    int oh = g[7], ow = g[8], sh = g[9], sw = g[10], ph = g[11], pw = g[12];
    int kx = i % kw;
    int ky = (i / kw) % kh;
    int ci = (i / (kw * kh)) % c;
    int co = i / (kw * kh * c);
    float acc = 0.0f;
    for (int b = 0; b < n; ++b) {
        for (int oy = 0; oy < oh; ++oy) {
            int iy = conv_source(oy, ky, sh, ph, h);
            if (iy < 0) continue;
            for (int ox = 0; ox < ow; ++ox) {
                int ix = conv_source(ox, kx, sw, pw, w);
                if (ix < 0) continue;
                acc += grad[((b * o + co) * oh + oy) * ow + ox]
                     * input[((b * c + ci) * h + iy) * w + ix];
            }
        }
    }
    out[i] = acc;
}

// flat (y * w + x) of the first maximum of window (oy, ox); value in *best
__device__ int pool_argmax(const float* input, int plane, int oy, int ox, const int* g, float* best) {
    int w = g[3], kh = g[4], kw = g[5], sh = g[8], sw = g[9];
    int y0 = oy * sh, x0 = ox * sw;
    int at = y0 * w + x0;
    float v_best = input[plane + at];
    for (int y = y0; y < y0 + kh; ++y) {
        for (int x = x0; x < x0 + kw; ++x) {
            float v = input[plane + y * w + x];
            if (v > v_best) {
                v_best = v;
                at = y * w + x;
            }
        }
    }
    *best = v_best;
    return at;
}

extern "C" __global__ void max_pool2d(const float* input, float* out, const int* g, int total) {
    int i = global_x();
    if (i >= total) return;
    int h = g[2], w = g[3], oh = g[6], ow = g[7];
    int ox = i % ow;
    int oy = (i / ow) % oh;
    int plane = (i / (ow * oh)) * h * w;
    float best;
    pool_argmax(input, plane, oy, ox, g, &best);
    out[i] = best;
}

extern "C" __global__ void max_pool2d_backward(const float* input, const float* grad, float* out,
                                               const int* g, int total) {
    int i = global_x();
    if (i >= total) return;
    int h = g[2], w = g[3], kh = g[4], kw = g[5], oh = g[6], ow = g[7], sh = g[8], sw = g[9];
    int x = i % w;
    int y = (i / w) % h;
    int nc = i / (w * h);
    int plane = nc * h * w;
    int oy_lo = (max(y + 1 - kh, 0) + sh - 1) / sh;
    int oy_hi = min(y / sh, oh - 1);
    int ox_lo = (max(x + 1 - kw, 0) + sw - 1) / sw;
    int ox_hi = min(x / sw, ow - 1);
    float acc = 0.0f;
    for (int oy = oy_lo; oy <= oy_hi; ++oy) {
        if (oy * sh > y || y >= oy * sh + kh) continue;
        for (int ox = ox_lo; ox <= ox_hi; ++ox) {
            if (ox * sw > x || x >= ox * sw + kw) continue;
            float best;
            if (pool_argmax(input, plane, oy, ox, g, &best) == y * w + x) {
                acc += grad[(nc * oh + oy) * ow + ox];
            }
        }
    }
    out[i] = acc;
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/conv",
    source: SOURCE,
    kernels: &[
        KernelDef {
            name: "conv2d",
            params: &[
                Param::buffer("input"),
                Param::buffer("weight"),
                Param::buffer("out"),
                Param::indices("geometry"),
                Param::int("total"),
            ],
            emulated: conv2d,
        },
        KernelDef {
            name: "conv2d_backward_input",
            params: &[
                Param::buffer("grad"),
                Param::buffer("weight"),
                Param::buffer("out"),
                Param::indices("geometry"),
                Param::int("total"),
            ],
            emulated: conv2d_backward_input,
        },
        KernelDef {
            name: "conv2d_backward_weight",
            params: &[
                Param::buffer("grad"),
                Param::buffer("input"),
                Param::buffer("out"),
                Param::indices("geometry"),
                Param::int("total"),
            ],
            emulated: conv2d_backward_weight,
        },
        KernelDef {
            name: "max_pool2d",
            params: &[
                Param::buffer("input"),
                Param::buffer("out"),
                Param::indices("geometry"),
                Param::int("total"),
            ],
            emulated: max_pool2d,
        },
        KernelDef {
            name: "max_pool2d_backward",
            params: &[
                Param::buffer("input"),
                Param::buffer("grad"),
                Param::buffer("out"),
                Param::indices("geometry"),
                Param::int("total"),
            ],
            emulated: max_pool2d_backward,
        },
    ],
};

struct Conv {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    o: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
}

impl Conv {
    fn read(buf: &Cells) -> Access<Self> {
        let g = read_indices(buf, CONV_GEOMETRY_LEN)?;
        Ok(Conv {
            n: g[0],
            c: g[1],
            h: g[2],
            w: g[3],
            o: g[4],
            kh: g[5],
            kw: g[6],
            oh: g[7],
            ow: g[8],
            sh: g[9],
            sw: g[10],
            ph: g[11],
            pw: g[12],
        })
    }
}

/// Input coordinate read by output `out` at tap `tap`.
#[inline]
fn source(out: usize, tap: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
    let p = (out * stride + tap).checked_sub(pad)?;
    (p < size).then_some(p)
}

/// Output coordinate reading input `input` at tap `tap`.
#[inline]
fn target(input: usize, tap: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
    let t = (input + pad).checked_sub(tap)?;
    if t % stride != 0 {
        return None;
    }
    let o = t / stride;
    (o < size).then_some(o)
}

fn conv2d(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let g = Conv::read(a.buffer(3)?)?;
    let (input, weight) = (a.buffer(0)?, a.buffer(1)?);
    let ox = i % g.ow;
    let oy = (i / g.ow) % g.oh;
    let co = (i / (g.ow * g.oh)) % g.o;
    let b = i / (g.ow * g.oh * g.o);
    let mut acc = 0.0f32;
    for ci in 0..g.c {
        for ky in 0..g.kh {
            let Some(iy) = source(oy, ky, g.sh, g.ph, g.h) else {
                continue;
            };
            for kx in 0..g.kw {
                let Some(ix) = source(ox, kx, g.sw, g.pw, g.w) else {
                    continue;
                };
                let x = input.load(((b * g.c + ci) * g.h + iy) * g.w + ix)?;
                let k = weight.load(((co * g.c + ci) * g.kh + ky) * g.kw + kx)?;
                acc += x * k;
            }
        }
    }
    a.buffer(2)?.store(i, acc)
}

fn conv2d_backward_input(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let g = Conv::read(a.buffer(3)?)?;
    let (grad, weight) = (a.buffer(0)?, a.buffer(1)?);
    let ix = i % g.w;
    let iy = (i / g.w) % g.h;
    let ci = (i / (g.w * g.h)) % g.c;
    let b = i / (g.w * g.h * g.c);
    let mut acc = 0.0f32;
    for co in 0..g.o {
        for ky in 0..g.kh {
            let Some(oy) = target(iy, ky, g.sh, g.ph, g.oh) else {
                continue;
            };
            for kx in 0..g.kw {
                let Some(ox) = target(ix, kx, g.sw, g.pw, g.ow) else {
                    continue;
                };
                let gv = grad.load(((b * g.o + co) * g.oh + oy) * g.ow + ox)?;
                let k = weight.load(((co * g.c + ci) * g.kh + ky) * g.kw + kx)?;
                acc += gv * k;
            }
        }
    }
    a.buffer(2)?.store(i, acc)
}

fn conv2d_backward_weight(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let g = Conv::read(a.buffer(3)?)?;
    let (grad, input) = (a.buffer(0)?, a.buffer(1)?);
    let kx = i % g.kw;
    let ky = (i / g.kw) % g.kh;
    let ci = (i / (g.kw * g.kh)) % g.c;
    let co = i / (g.kw * g.kh * g.c);
    let mut acc = 0.0f32;
    for b in 0..g.n {
        for oy in 0..g.oh {
            let Some(iy) = source(oy, ky, g.sh, g.ph, g.h) else {
                continue;
            };
            for ox in 0..g.ow {
                let Some(ix) = source(ox, kx, g.sw, g.pw, g.w) else {
                    continue;
                };
                let gv = grad.load(((b * g.o + co) * g.oh + oy) * g.ow + ox)?;
                let x = input.load(((b * g.c + ci) * g.h + iy) * g.w + ix)?;
                acc += gv * x;
            }
        }
    }
    a.buffer(2)?.store(i, acc)
}

struct Pool {
    h: usize,
    w: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    sh: usize,
    sw: usize,
}

impl Pool {
    fn read(buf: &Cells) -> Access<Self> {
        let g = read_indices(buf, POOL_GEOMETRY_LEN)?;
        Ok(Pool {
            h: g[2],
            w: g[3],
            kh: g[4],
            kw: g[5],
            oh: g[6],
            ow: g[7],
            sh: g[8],
            sw: g[9],
        })
    }

    /// (value, y, x) of the first maximum of window (oy, ox) in `plane`.
    fn argmax(&self, input: &Cells, plane: usize, oy: usize, ox: usize) -> Access<(f32, usize, usize)> {
        let (y0, x0) = (oy * self.sh, ox * self.sw);
        let mut best = (f32::NEG_INFINITY, y0, x0);
        let mut first = true;
        for y in y0..y0 + self.kh {
            for x in x0..x0 + self.kw {
                let v = input.load(plane + y * self.w + x)?;
                if first || v > best.0 {
                    best = (v, y, x);
                    first = false;
                }
            }
        }
        Ok(best)
    }
}

fn max_pool2d(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(3)? {
        return Ok(());
    }
    let p = Pool::read(a.buffer(2)?)?;
    let ox = i % p.ow;
    let oy = (i / p.ow) % p.oh;
    let plane = (i / (p.ow * p.oh)) * p.h * p.w;
    let (v, _, _) = p.argmax(a.buffer(0)?, plane, oy, ox)?;
    a.buffer(1)?.store(i, v)
}

fn max_pool2d_backward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let p = Pool::read(a.buffer(3)?)?;
    let (input, grad) = (a.buffer(0)?, a.buffer(1)?);
    let x = i % p.w;
    let y = (i / p.w) % p.h;
    let nc = i / (p.w * p.h);
    let plane = nc * p.h * p.w;
    // windows whose span covers (y, x)
    let oy_lo = (y + 1).saturating_sub(p.kh).div_ceil(p.sh);
    let oy_hi = (y / p.sh).min(p.oh.saturating_sub(1));
    let ox_lo = (x + 1).saturating_sub(p.kw).div_ceil(p.sw);
    let ox_hi = (x / p.sw).min(p.ow.saturating_sub(1));
    let mut acc = 0.0f32;
    for oy in oy_lo..=oy_hi {
        if oy * p.sh > y || y >= oy * p.sh + p.kh {
            continue;
        }
        for ox in ox_lo..=ox_hi {
            if ox * p.sw > x || x >= ox * p.sw + p.kw {
                continue;
            }
            let (_, by, bx) = p.argmax(input, plane, oy, ox)?;
            if (by, bx) == (y, x) {
                acc += grad.load((nc * p.oh + oy) * p.ow + ox)?;
            }
        }
    }
    a.buffer(2)?.store(i, acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_and_target_are_inverse() {
        for out in 0..4 {
            for tap in 0..3 {
                if let Some(p) = source(out, tap, 2, 1, 8) {
                    assert_eq!(target(p, tap, 2, 1, 4), Some(out));
                }
            }
        }
    }
}
