use crate::kernel::{KernelDef, Param, Program};
use crate::runtime::emulator::{Access, Args, WorkItem};

const SOURCE: &str = r#"
extern "C" __global__ void fill(float* out, float value, int n) {
    int i = global_x();
    if (i >= n) return;
    out[i] = value;
}
"#;

pub static PROGRAM: Program = Program {
    path: "kernels/fill",
    source: SOURCE,
    kernels: &[KernelDef {
        name: "fill",
        params: &[Param::buffer("out"), Param::float("value"), Param::int("n")],
        emulated: fill,
    }],
};

fn fill(item: &WorkItem, a: &Args<'_>) -> Access<()> {
    let i = item.id(0);
    if i >= a.usize(2)? {
        return Ok(());
    }
    a.buffer(0)?.store(i, a.float(1)?)
}
