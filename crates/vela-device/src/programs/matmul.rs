// Batched matrix product over contiguous [m, k] · [k, n] blocks.
//
// Global size is [n, m, batch]. Broadcast batch dims are resolved on the
// host: a_offsets/b_offsets/c_offsets hold the element offset of each
// batch's block in A, B and C.

use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, WorkItem};

const SOURCE: &str = r#"
extern "C" __global__ void matmul_batched(const float* a, const float* b, float* out,
                                          const int* a_offsets, const int* b_offsets, const int* c_offsets,
                                          int m, int k, int n, int batch) {
    int col = global_x();
    int row = global_y();
    int bt = global_z();
    if (col >= n || row >= m || bt >= batch) return;
    int ao = a_offsets[bt] + row * k;
    int bo = b_offsets[bt] + col;
    float acc = 0.0f;
    for (int p = 0; p < k; ++p) acc += a[ao + p] * b[bo + p * n];
    out[c_offsets[bt] + row * n + col] = acc;
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/matmul",
    source: SOURCE,
    kernels: &[KernelDef {
        name: "matmul_batched",
        params: &[
            Param::buffer("a"),
            Param::buffer("b"),
            Param::buffer("out"),
            Param::indices("a_offsets"),
            Param::indices("b_offsets"),
            Param::indices("c_offsets"),
            Param::int("m"),
            Param::int("k"),
            Param::int("n"),
            Param::int("batch"),
        ],
        emulated: matmul_batched,
    }],
};

fn matmul_batched(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let (col, row, bt) = (item.id(0), item.id(1), item.id(2));
    let (m, k, n) = (a.usize(6)?, a.usize(7)?, a.usize(8)?);
    if col >= n || row >= m || bt >= a.usize(9)? {
        return Ok(());
    }
    let lhs = a.buffer(0)?;
    let rhs = a.buffer(1)?;
    let ao = a.buffer(3)?.index(bt)? + row * k;
    let bo = a.buffer(4)?.index(bt)? + col;
    let mut acc = 0.0f32;
    for p in 0..k {
        acc += lhs.load(ao + p)? * rhs.load(bo + p * n)?;
    }
    let co = a.buffer(5)?.index(bt)?;
    a.buffer(2)?.store(co + row * n + col, acc)
}
