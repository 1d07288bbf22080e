// 2-D convolution and max pooling over NCHW tensors.
//
// All three convolution passes are written in gather form (every output
// element reads what it needs), so rows of the result can be computed
// independently on different workers.

use vela_core::{bail, Conv2dParams, Layout, Pool2dParams, Result, Shape};

use crate::config::HostConfig;
use crate::layout_ops::contiguous;
use crate::parallel::for_each_row_block;

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    o: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    stride: [usize; 2],
    pad: [usize; 2],
}

impl ConvGeometry {
    fn new(input: &Shape, weight: &Shape, params: &Conv2dParams) -> Result<Self> {
        let (i, k) = (input.dims(), weight.dims());
        if i.len() != 4 || k.len() != 4 || i[1] != k[1] {
            bail!("conv2d: incompatible input {input} and weight {weight}");
        }
        let Some((oh, ow)) = params.output_hw(i[2], i[3], k[2], k[3]) else {
            bail!("conv2d: kernel {weight} does not fit input {input}");
        };
        Ok(ConvGeometry {
            n: i[0],
            c: i[1],
            h: i[2],
            w: i[3],
            o: k[0],
            kh: k[2],
            kw: k[3],
            oh,
            ow,
            stride: params.stride,
            pad: params.padding,
        })
    }

    /// Input coordinate read by output coordinate `out` at kernel tap `tap`.
    #[inline]
    fn source(out: usize, tap: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
        let p = (out * stride + tap).checked_sub(pad)?;
        (p < size).then_some(p)
    }

    /// Output coordinate that reads input coordinate `input` at `tap`, if any.
    #[inline]
    fn target(input: usize, tap: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
        let t = (input + pad).checked_sub(tap)?;
        if t % stride != 0 {
            return None;
        }
        let o = t / stride;
        (o < size).then_some(o)
    }
}

pub fn conv2d(
    cfg: &HostConfig,
    input: &[f32],
    input_layout: &Layout,
    weight: &[f32],
    weight_layout: &Layout,
    params: &Conv2dParams,
) -> Result<Vec<f32>> {
    let g = ConvGeometry::new(input_layout.shape(), weight_layout.shape(), params)?;
    let x = contiguous(cfg, input, input_layout);
    let k = contiguous(cfg, weight, weight_layout);
    let mut out = vec![0.0f32; g.n * g.o * g.oh * g.ow];
    for_each_row_block(cfg, &mut out, g.ow, |first, rows| {
        for (r, row) in rows.chunks_mut(g.ow).enumerate() {
            let idx = first + r;
            let oy = idx % g.oh;
            let o = (idx / g.oh) % g.o;
            let b = idx / (g.oh * g.o);
            for (ox, acc) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for c in 0..g.c {
                    let x_plane = (b * g.c + c) * g.h * g.w;
                    let k_plane = (o * g.c + c) * g.kh * g.kw;
                    for ky in 0..g.kh {
                        let Some(iy) = ConvGeometry::source(oy, ky, g.stride[0], g.pad[0], g.h)
                        else {
                            continue;
                        };
                        for kx in 0..g.kw {
                            let Some(ix) =
                                ConvGeometry::source(ox, kx, g.stride[1], g.pad[1], g.w)
                            else {
                                continue;
                            };
                            sum += x[x_plane + iy * g.w + ix] * k[k_plane + ky * g.kw + kx];
                        }
                    }
                }
                *acc = sum;
            }
        }
    });
    Ok(out)
}

pub fn conv2d_backward_input(
    cfg: &HostConfig,
    grad: &[f32],
    grad_layout: &Layout,
    weight: &[f32],
    weight_layout: &Layout,
    input_shape: &Shape,
    params: &Conv2dParams,
) -> Result<Vec<f32>> {
    let g = ConvGeometry::new(input_shape, weight_layout.shape(), params)?;
    let dy = contiguous(cfg, grad, grad_layout);
    let k = contiguous(cfg, weight, weight_layout);
    let mut dx = vec![0.0f32; input_shape.elem_count()];
    for_each_row_block(cfg, &mut dx, g.w, |first, rows| {
        for (r, row) in rows.chunks_mut(g.w).enumerate() {
            let idx = first + r;
            let iy = idx % g.h;
            let c = (idx / g.h) % g.c;
            let b = idx / (g.h * g.c);
            for (ix, acc) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for o in 0..g.o {
                    let dy_plane = (b * g.o + o) * g.oh * g.ow;
                    let k_plane = (o * g.c + c) * g.kh * g.kw;
                    for ky in 0..g.kh {
                        let Some(oy) = ConvGeometry::target(iy, ky, g.stride[0], g.pad[0], g.oh)
                        else {
                            continue;
                        };
                        for kx in 0..g.kw {
                            let Some(ox) =
                                ConvGeometry::target(ix, kx, g.stride[1], g.pad[1], g.ow)
                            else {
                                continue;
                            };
                            sum += dy[dy_plane + oy * g.ow + ox] * k[k_plane + ky * g.kw + kx];
                        }
                    }
                }
                *acc = sum;
            }
        }
    });
    Ok(dx)
}

pub fn conv2d_backward_weight(
    cfg: &HostConfig,
    grad: &[f32],
    grad_layout: &Layout,
    input: &[f32],
    input_layout: &Layout,
    weight_shape: &Shape,
    params: &Conv2dParams,
) -> Result<Vec<f32>> {
    let g = ConvGeometry::new(input_layout.shape(), weight_shape, params)?;
    let dy = contiguous(cfg, grad, grad_layout);
    let x = contiguous(cfg, input, input_layout);
    let mut dw = vec![0.0f32; weight_shape.elem_count()];
    for_each_row_block(cfg, &mut dw, g.kw, |first, rows| {
        for (r, row) in rows.chunks_mut(g.kw).enumerate() {
            let idx = first + r;
            let ky = idx % g.kh;
            let c = (idx / g.kh) % g.c;
            let o = idx / (g.kh * g.c);
            for (kx, acc) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for b in 0..g.n {
                    let dy_plane = (b * g.o + o) * g.oh * g.ow;
                    let x_plane = (b * g.c + c) * g.h * g.w;
                    for oy in 0..g.oh {
                        let Some(iy) = ConvGeometry::source(oy, ky, g.stride[0], g.pad[0], g.h)
                        else {
                            continue;
                        };
                        for ox in 0..g.ow {
                            let Some(ix) =
                                ConvGeometry::source(ox, kx, g.stride[1], g.pad[1], g.w)
                            else {
                                continue;
                            };
                            sum += dy[dy_plane + oy * g.ow + ox] * x[x_plane + iy * g.w + ix];
                        }
                    }
                }
                *acc = sum;
            }
        }
    });
    Ok(dw)
}

struct PoolGeometry {
    planes: usize,
    h: usize,
    w: usize,
    oh: usize,
    ow: usize,
}

impl PoolGeometry {
    fn new(input: &Shape, params: &Pool2dParams) -> Result<Self> {
        let d = input.dims();
        if d.len() != 4 {
            bail!("max_pool2d: expected an NCHW input, got {input}");
        }
        let Some((oh, ow)) = params.output_hw(d[2], d[3]) else {
            bail!("max_pool2d: window {params:?} does not fit input {input}");
        };
        Ok(PoolGeometry {
            planes: d[0] * d[1],
            h: d[2],
            w: d[3],
            oh,
            ow,
        })
    }
}

/// Position (within its plane) and value of the first maximum of a window.
#[inline]
fn window_argmax(plane: &[f32], w: usize, oy: usize, ox: usize, params: &Pool2dParams) -> usize {
    let [kh, kw] = params.kernel;
    let (y0, x0) = (oy * params.stride[0], ox * params.stride[1]);
    let mut best = y0 * w + x0;
    for y in y0..y0 + kh {
        for x in x0..x0 + kw {
            let p = y * w + x;
            if plane[p] > plane[best] {
                best = p;
            }
        }
    }
    best
}

pub fn max_pool2d(
    cfg: &HostConfig,
    input: &[f32],
    layout: &Layout,
    params: &Pool2dParams,
) -> Result<Vec<f32>> {
    let g = PoolGeometry::new(layout.shape(), params)?;
    let x = contiguous(cfg, input, layout);
    let plane_out = g.oh * g.ow;
    let mut out = vec![0.0f32; g.planes * plane_out];
    for_each_row_block(cfg, &mut out, plane_out, |first, planes| {
        for (p, dst) in planes.chunks_mut(plane_out).enumerate() {
            let src = &x[(first + p) * g.h * g.w..(first + p + 1) * g.h * g.w];
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    dst[oy * g.ow + ox] = src[window_argmax(src, g.w, oy, ox, params)];
                }
            }
        }
    });
    Ok(out)
}

/// Each window's gradient goes to the first maximal element of that window.
pub fn max_pool2d_backward(
    cfg: &HostConfig,
    input: &[f32],
    input_layout: &Layout,
    grad: &[f32],
    grad_layout: &Layout,
    params: &Pool2dParams,
) -> Result<Vec<f32>> {
    let g = PoolGeometry::new(input_layout.shape(), params)?;
    let x = contiguous(cfg, input, input_layout);
    let dy = contiguous(cfg, grad, grad_layout);
    let plane_in = g.h * g.w;
    let plane_out = g.oh * g.ow;
    let mut dx = vec![0.0f32; g.planes * plane_in];
    for_each_row_block(cfg, &mut dx, plane_in, |first, planes| {
        for (p, dst) in planes.chunks_mut(plane_in).enumerate() {
            let plane = first + p;
            let src = &x[plane * plane_in..(plane + 1) * plane_in];
            let gp = &dy[plane * plane_out..(plane + 1) * plane_out];
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    dst[window_argmax(src, g.w, oy, ox, params)] += gp[oy * g.ow + ox];
                }
            }
        }
    });
    Ok(dx)
}
