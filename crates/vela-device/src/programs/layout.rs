// Data movement kernels: strided copy, slice gather/scatter, concat.

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, WorkItem};

use super::read_indices;

const SOURCE: &str = r#"
__device__ int slice_source(int i, const int* dims, const int* strides,
                            const int* starts, const int* steps, int rank) {
    int rest = i, src = 0;
    for (int d = rank - 1; d >= 0; --d) {
        int c = rest % dims[d];
        rest /= dims[d];
        src += (starts[d] + c * steps[d]) * strides[d];
    }
    return src;
}

extern "C" __global__ void copy_strided(const float* input, float* out, const int* dims,
                                        const int* strides, int rank, int n) {
    int i = global_x();
    if (i >= n) return;
    int rest = i, src = 0;
    for (int d = rank - 1; d >= 0; --d) {
        src += (rest % dims[d]) * strides[d];
        rest /= dims[d];
    }
    out[i] = input[src];
}

extern "C" __global__ void slice_gather(const float* input, float* out, const int* out_dims,
                                        const int* in_strides, const int* starts, const int* steps,
                                        int rank, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = input[slice_source(i, out_dims, in_strides, starts, steps, rank)];
}

extern "C" __global__ void slice_scatter_add(float* dst, const float* src, const int* src_dims,
                                             const int* dst_strides, const int* starts, const int* steps,
                                             int rank, int n) {
    int i = global_x();
    if (i >= n) return;
    atomicAdd(&dst[slice_source(i, src_dims, dst_strides, starts, steps, rank)], src[i]);
}

extern "C" __global__ void concat_copy(const float* input, float* out, int inner_in, int inner_out,
                                       int offset, int n) {
    int i = global_x();
    if (i >= n) return;
    out[(i / inner_in) * inner_out + offset + i % inner_in] = input[i];
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/layout",
    source: SOURCE,
    kernels: &[
        KernelDef {
            name: "copy_strided",
            params: &[
                Param::buffer("input"),
                Param::buffer("out"),
                Param::indices("dims"),
                Param::indices("strides"),
                Param::int("rank"),
                Param::int("n"),
            ],
            emulated: copy_strided,
        },
        KernelDef {
            name: "slice_gather",
            params: &[
                Param::buffer("input"),
                Param::buffer("out"),
                Param::indices("out_dims"),
                Param::indices("in_strides"),
                Param::indices("starts"),
                Param::indices("steps"),
                Param::int("rank"),
                Param::int("n"),
            ],
            emulated: slice_gather,
        },
        KernelDef {
            name: "slice_scatter_add",
            params: &[
                Param::buffer("dst"),
                Param::buffer("src"),
                Param::indices("src_dims"),
                Param::indices("dst_strides"),
                Param::indices("starts"),
                Param::indices("steps"),
                Param::int("rank"),
                Param::int("n"),
            ],
            emulated: slice_scatter_add,
        },
        KernelDef {
            name: "concat_copy",
            params: &[
                Param::buffer("input"),
                Param::buffer("out"),
                Param::int("inner_in"),
                Param::int("inner_out"),
                Param::int("offset"),
                Param::int("n"),
            ],
            emulated: concat_copy,
        },
    ],
};

fn copy_strided(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(5)? {
        return Ok(());
    }
    let rank = a.usize(4)?;
    let dims = a.buffer(2)?;
    let strides = a.buffer(3)?;
    let (mut rest, mut src) = (i, 0);
    for d in (0..rank).rev() {
        let extent = dims.index(d)?;
        src += (rest % extent) * strides.index(d)?;
        rest /= extent;
    }
    a.buffer(1)?.store(i, a.buffer(0)?.load(src)?)
}

/// Position in the sliced source of element `i` of the slice.
fn slice_source(i: usize, dims: &[usize], strides: &[usize], starts: &[usize], steps: &[usize]) -> usize {
    let (mut rest, mut src) = (i, 0);
    for d in (0..dims.len()).rev() {
        let c = rest % dims[d];
        rest /= dims[d];
        src += (starts[d] + c * steps[d]) * strides[d];
    }
    src
}

fn slice_gather(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(7)? {
        return Ok(());
    }
    let rank = a.usize(6)?;
    let src = slice_source(
        i,
        &read_indices(a.buffer(2)?, rank)?,
        &read_indices(a.buffer(3)?, rank)?,
        &read_indices(a.buffer(4)?, rank)?,
        &read_indices(a.buffer(5)?, rank)?,
    );
    a.buffer(1)?.store(i, a.buffer(0)?.load(src)?)
}

fn slice_scatter_add(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(7)? {
        return Ok(());
    }
    let rank = a.usize(6)?;
    let dst = slice_source(
        i,
        &read_indices(a.buffer(2)?, rank)?,
        &read_indices(a.buffer(3)?, rank)?,
        &read_indices(a.buffer(4)?, rank)?,
        &read_indices(a.buffer(5)?, rank)?,
    );
    a.buffer(0)?.add_f32(dst, a.buffer(1)?.load(i)?)
}

/// Input viewed as [outer, inner_in] lands at out[o·inner_out + offset + j].
fn concat_copy(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(5)? {
        return Ok(());
    }
    let inner_in = a.usize(2)?;
    let (o, j) = (i / inner_in, i % inner_in);
    let dst = o * a.usize(3)? + a.usize(4)? + j;
    a.buffer(1)?.store(dst, a.buffer(0)?.load(i)?)
}
