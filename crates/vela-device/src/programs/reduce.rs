// sum_axes: one work item per output element, summing every input element
// that broadcasts onto it. The output is right-aligned against the input;
// an input dim is reduced where the output has extent 1 (or no dim at all).

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, WorkItem};

use super::read_indices;

const SOURCE: &str = r#"
extern "C" __global__ void sum_axes(const float* input, const int* in_dims, const int* in_strides,
                                    float* out, const int* out_dims,
                                    int in_rank, int out_rank, int n_out, int count) {
    int o = global_x();
    if (o >= n_out) return;
    int lead = in_rank > out_rank ? in_rank - out_rank : 0;
    float acc = 0.0f;
    for (int r = 0; r < count; ++r) {
        int oo = o, rr = r, offset = 0;
        for (int d = in_rank - 1; d >= 0; --d) {
            int target = d < lead ? 1 : out_dims[d - lead];
            int dim = in_dims[d];
            int c;
            if (target == 1 && dim != 1) {
                c = rr % dim;
                rr /= dim;
            } else {
                c = oo % target;
                oo /= target;
            }
            offset += c * in_strides[d];
        }
        acc += input[offset];
    }
    out[o] = acc;
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/reduce",
    source: SOURCE,
    kernels: &[KernelDef {
        name: "sum_axes",
        params: &[
            Param::buffer("input"),
            Param::indices("in_dims"),
            Param::indices("in_strides"),
            Param::buffer("out"),
            Param::indices("out_dims"),
            Param::int("in_rank"),
            Param::int("out_rank"),
            Param::int("n_out"),
            Param::int("count"),
        ],
        emulated: sum_axes,
    }],
};

fn sum_axes(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let o = item.id(0);
    if o >= a.usize(7)? {
        return Ok(());
    }
    let in_rank = a.usize(5)?;
    let out_rank = a.usize(6)?;
    let lead = in_rank.saturating_sub(out_rank);
    let dims = read_indices(a.buffer(1)?, in_rank)?;
    let strides = read_indices(a.buffer(2)?, in_rank)?;
    let out_dims = read_indices(a.buffer(4)?, out_rank)?;
    let target: Vec<usize> = (0..in_rank)
        .map(|d| if d < lead { 1 } else { out_dims[d - lead] })
        .collect();

    let input = a.buffer(0)?;
    let mut acc = 0.0f32;
    for r in 0..a.usize(8)? {
        let (mut oo, mut rr, mut offset) = (o, r, 0);
        for d in (0..in_rank).rev() {
            let c = if target[d] == 1 && dims[d] != 1 {
                let c = rr % dims[d];
                rr /= dims[d];
                c
            } else {
                let c = oo % target[d];
                oo /= target[d];
                c
            };
            offset += c * strides[d];
        }
        acc += input.load(offset)?;
    }
    a.buffer(3)?.store(o, acc)
}
