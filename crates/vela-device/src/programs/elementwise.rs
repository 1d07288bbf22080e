// Element-wise kernels: binary ops with broadcasting, scalar ops and
// activations.
//
// Broadcasting comes in three forms, picked on the host:
//
//   binary_same     both operands have the output shape
//   binary_bcast    the small operand is [outer.., 1.., inner..] against the
//                   output; `broadcast_dim` is the inner extent and `batch`
//                   the stretched middle extent, so the small index is
//                   (i / (batch·broadcast_dim))·broadcast_dim + i % broadcast_dim.
//                   Covers rank-2 + vector and rank-3 + trailing matrix or
//                   vector without expanding anything on the host.
//   binary_generic  per-element unravel against the output dims with each
//                   operand's own dims/strides descriptors

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, Cells, WorkItem};

use super::{activation, binary_op};

const SOURCE: &str = r#"
__device__ __forceinline__ int small_index(int i, int broadcast_dim, int batch) {
    return (i / (batch * broadcast_dim)) * broadcast_dim + i % broadcast_dim;
}

__device__ int broadcast_offset(int i, const int* out_dims, int out_rank,
                                const int* dims, const int* strides, int rank) {
    int offset = 0;
    for (int d = out_rank - 1; d >= 0; --d) {
        int extent = out_dims[d];
        int c = i % extent;
        i /= extent;
        if (d + rank >= out_rank) {
            int od = d + rank - out_rank;
            if (dims[od] != 1) offset += c * strides[od];
        }
    }
    return offset;
}

extern "C" __global__ void binary_same(const float* a, const float* b, float* out, int op, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = apply_binary(op, a[i], b[i]);
}

extern "C" __global__ void binary_bcast(const float* a, const float* b, float* out, int op, int n,
                                        int broadcast_dim, int batch, int small_side) {
    int i = global_x();
    if (i >= n) return;
    int s = small_index(i, broadcast_dim, batch);
    out[i] = small_side == 0 ? apply_binary(op, a[s], b[i]) : apply_binary(op, a[i], b[s]);
}

extern "C" __global__ void binary_generic(const float* a, const int* a_dims, const int* a_strides,
                                          const float* b, const int* b_dims, const int* b_strides,
                                          float* out, const int* out_dims,
                                          int a_rank, int b_rank, int out_rank, int op, int n) {
    int i = global_x();
    if (i >= n) return;
    int ao = broadcast_offset(i, out_dims, out_rank, a_dims, a_strides, a_rank);
    int bo = broadcast_offset(i, out_dims, out_rank, b_dims, b_strides, b_rank);
    out[i] = apply_binary(op, a[ao], b[bo]);
}

extern "C" __global__ void binary_same_inplace(float* a, const float* b, int op, int n) {
    int i = global_x();
    if (i >= n) return;
    a[i] = apply_binary(op, a[i], b[i]);
}

extern "C" __global__ void binary_bcast_inplace(float* a, const float* b, int op, int n,
                                                int broadcast_dim, int batch) {
    int i = global_x();
    if (i >= n) return;
    a[i] = apply_binary(op, a[i], b[small_index(i, broadcast_dim, batch)]);
}

extern "C" __global__ void binary_generic_inplace(float* a, const int* a_dims,
                                                  const float* b, const int* b_dims, const int* b_strides,
                                                  int a_rank, int b_rank, int op, int n) {
    int i = global_x();
    if (i >= n) return;
    int bo = broadcast_offset(i, a_dims, a_rank, b_dims, b_strides, b_rank);
    a[i] = apply_binary(op, a[i], b[bo]);
}

extern "C" __global__ void scalar(const float* x, float* out, int op, float value, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = apply_binary(op, x[i], value);
}

extern "C" __global__ void activation(const float* x, float* out, int act, float param, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = apply_activation(act, param, x[i]);
}

extern "C" __global__ void activation_backward(const float* x, const float* grad, float* out,
                                               int act, float param, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = grad[i] * activation_derivative(act, param, x[i]);
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/elementwise",
    source: SOURCE,
    kernels: &[
        KernelDef {
            name: "binary_same",
            params: &[
                Param::buffer("a"),
                Param::buffer("b"),
                Param::buffer("out"),
                Param::int("op"),
                Param::int("n"),
            ],
            emulated: binary_same,
        },
        KernelDef {
            name: "binary_bcast",
            params: &[
                Param::buffer("a"),
                Param::buffer("b"),
                Param::buffer("out"),
                Param::int("op"),
                Param::int("n"),
                Param::int("broadcast_dim"),
                Param::int("batch"),
                Param::int("small_side"),
            ],
            emulated: binary_bcast,
        },
        KernelDef {
            name: "binary_generic",
            params: &[
                Param::buffer("a"),
                Param::indices("a_dims"),
                Param::indices("a_strides"),
                Param::buffer("b"),
                Param::indices("b_dims"),
                Param::indices("b_strides"),
                Param::buffer("out"),
                Param::indices("out_dims"),
                Param::int("a_rank"),
                Param::int("b_rank"),
                Param::int("out_rank"),
                Param::int("op"),
                Param::int("n"),
            ],
            emulated: binary_generic,
        },
        KernelDef {
            name: "binary_same_inplace",
            params: &[
                Param::buffer("a"),
                Param::buffer("b"),
                Param::int("op"),
                Param::int("n"),
            ],
            emulated: binary_same_inplace,
        },
        KernelDef {
            name: "binary_bcast_inplace",
            params: &[
                Param::buffer("a"),
                Param::buffer("b"),
                Param::int("op"),
                Param::int("n"),
                Param::int("broadcast_dim"),
                Param::int("batch"),
            ],
            emulated: binary_bcast_inplace,
        },
        KernelDef {
            name: "binary_generic_inplace",
            params: &[
                Param::buffer("a"),
                Param::indices("a_dims"),
                Param::buffer("b"),
                Param::indices("b_dims"),
                Param::indices("b_strides"),
                Param::int("a_rank"),
                Param::int("b_rank"),
                Param::int("op"),
                Param::int("n"),
            ],
            emulated: binary_generic_inplace,
        },
        KernelDef {
            name: "scalar",
            params: &[
                Param::buffer("x"),
                Param::buffer("out"),
                Param::int("op"),
                Param::float("value"),
                Param::int("n"),
            ],
            emulated: scalar,
        },
        KernelDef {
            name: "activation",
            params: &[
                Param::buffer("x"),
                Param::buffer("out"),
                Param::int("act"),
                Param::float("param"),
                Param::int("n"),
            ],
            emulated: activation_forward,
        },
        KernelDef {
            name: "activation_backward",
            params: &[
                Param::buffer("x"),
                Param::buffer("grad"),
                Param::buffer("out"),
                Param::int("act"),
                Param::float("param"),
                Param::int("n"),
            ],
            emulated: activation_backward,
        },
    ],
};

#[inline(always)]
fn small_index(i: usize, broadcast_dim: usize, batch: usize) -> usize {
    (i / (batch * broadcast_dim)) * broadcast_dim + i % broadcast_dim
}

/// Offset into a contiguous operand (right-aligned against the output) for
/// output element `i`. Size-1 dims contribute nothing.
fn broadcast_offset(
    mut i: usize,
    out_dims: &Cells,
    out_rank: usize,
    dims: &Cells,
    strides: &Cells,
    rank: usize,
) -> Access<usize> {
    let mut offset = 0;
    for d in (0..out_rank).rev() {
        let extent = out_dims.index(d)?;
        let c = i % extent;
        i /= extent;
        if d + rank >= out_rank {
            let od = d + rank - out_rank;
            if dims.index(od)? != 1 {
                offset += c * strides.index(od)?;
            }
        }
    }
    Ok(offset)
}

fn binary_same(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let op = binary_op(a.int(3)?)?;
    let v = op.apply(a.buffer(0)?.load(i)?, a.buffer(1)?.load(i)?);
    a.buffer(2)?.store(i, v)
}

fn binary_bcast(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let op = binary_op(a.int(3)?)?;
    let s = small_index(i, a.usize(5)?, a.usize(6)?);
    let (lhs, rhs) = if a.int(7)? == 0 {
        (a.buffer(0)?.load(s)?, a.buffer(1)?.load(i)?)
    } else {
        (a.buffer(0)?.load(i)?, a.buffer(1)?.load(s)?)
    };
    a.buffer(2)?.store(i, op.apply(lhs, rhs))
}

fn binary_generic(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(12)? {
        return Ok(());
    }
    let op = binary_op(a.int(11)?)?;
    let out_dims = a.buffer(7)?;
    let out_rank = a.usize(10)?;
    let ao = broadcast_offset(i, out_dims, out_rank, a.buffer(1)?, a.buffer(2)?, a.usize(8)?)?;
    let bo = broadcast_offset(i, out_dims, out_rank, a.buffer(4)?, a.buffer(5)?, a.usize(9)?)?;
    let v = op.apply(a.buffer(0)?.load(ao)?, a.buffer(3)?.load(bo)?);
    a.buffer(6)?.store(i, v)
}

fn binary_same_inplace(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(3)? {
        return Ok(());
    }
    let op = binary_op(a.int(2)?)?;
    let dst = a.buffer(0)?;
    dst.store(i, op.apply(dst.load(i)?, a.buffer(1)?.load(i)?))
}

fn binary_bcast_inplace(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(3)? {
        return Ok(());
    }
    let op = binary_op(a.int(2)?)?;
    let s = small_index(i, a.usize(4)?, a.usize(5)?);
    let dst = a.buffer(0)?;
    dst.store(i, op.apply(dst.load(i)?, a.buffer(1)?.load(s)?))
}

fn binary_generic_inplace(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(8)? {
        return Ok(());
    }
    let op = binary_op(a.int(7)?)?;
    let bo = broadcast_offset(i, a.buffer(1)?, a.usize(5)?, a.buffer(3)?, a.buffer(4)?, a.usize(6)?)?;
    let dst = a.buffer(0)?;
    dst.store(i, op.apply(dst.load(i)?, a.buffer(2)?.load(bo)?))
}

fn scalar(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let op = binary_op(a.int(2)?)?;
    let v = op.apply(a.buffer(0)?.load(i)?, a.float(3)?);
    a.buffer(1)?.store(i, v)
}

fn activation_forward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(4)? {
        return Ok(());
    }
    let act = activation(a.int(2)?, a.float(3)?)?;
    a.buffer(1)?.store(i, act.apply(a.buffer(0)?.load(i)?))
}

fn activation_backward(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(5)? {
        return Ok(());
    }
    let act = activation(a.int(3)?, a.float(4)?)?;
    let g = a.buffer(1)?.load(i)? * act.derivative(a.buffer(0)?.load(i)?);
    a.buffer(2)?.store(i, g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_index_walks_pattern() {
        // [2, 3, 4] against [2, 1, 4]: batch 3, inner 4
        let idx: Vec<usize> = (0..24).map(|i| small_index(i, 4, 3)).collect();
        assert_eq!(&idx[..8], &[0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(&idx[12..16], &[4, 5, 6, 7]);
    }
}
