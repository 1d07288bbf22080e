// Bundled kernel programs
//
// Each submodule is one program, addressed by its resource path: the CUDA C
// source of its kernels (built with `PRELUDE` in front) and, per kernel, the
// emulated body the in-process runtime runs instead. Both forms take the
// same arguments in the same order and do their own bounds checks against
// the problem size passed in.
//
// Shape descriptors travel as i32 index buffers: dims and strides of
// contiguous operands, batch offsets, convolution geometry.

pub mod attention;
pub mod conv;
pub mod elementwise;
pub mod fill;
pub mod layout;
pub mod matmul;
pub mod norm;
pub mod reduce;

use vela_core::{Activation, BinaryOp};

use crate::kernel::Program;
use crate::runtime::emulator::{Access, AccessFault, Cells};

/// Device helpers shared by every program: thread ids, the binary-op and
/// activation codes of `BinaryOp::code` / `Activation::encode`.
pub const PRELUDE: &str = r#"
#define NEG_INF __int_as_float(0xff800000)
#define QNAN __int_as_float(0x7fc00000)
#define SQRT_2_OVER_PI 0.7978846f
#define GELU_COEFF 0.044715f

__device__ __forceinline__ int global_x() { return blockIdx.x * blockDim.x + threadIdx.x; }
__device__ __forceinline__ int global_y() { return blockIdx.y * blockDim.y + threadIdx.y; }
__device__ __forceinline__ int global_z() { return blockIdx.z * blockDim.z + threadIdx.z; }

__device__ __forceinline__ float apply_binary(int op, float a, float b) {
    switch (op) {
        case 0: return a + b;
        case 1: return a - b;
        case 2: return a * b;
        case 3: return a / b;
        default: return QNAN;
    }
}

__device__ __forceinline__ float sigmoid_f(float x) { return 1.0f / (1.0f + expf(-x)); }

__device__ float apply_activation(int act, float param, float x) {
    switch (act) {
        case 0: return x;
        case 1: return fmaxf(x, 0.0f);
        case 2: return x > 0.0f ? x : param * x;
        case 3: return sigmoid_f(x);
        case 4: return tanhf(x);
        case 5: {
            float inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
            return 0.5f * x * (1.0f + tanhf(inner));
        }
        case 6: return x * sigmoid_f(x);
        default: return QNAN;
    }
}

__device__ float activation_derivative(int act, float param, float x) {
    switch (act) {
        case 0: return 1.0f;
        case 1: return x > 0.0f ? 1.0f : 0.0f;
        case 2: return x > 0.0f ? 1.0f : param;
        case 3: { float s = sigmoid_f(x); return s * (1.0f - s); }
        case 4: { float t = tanhf(x); return 1.0f - t * t; }
        case 5: {
            float inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
            float t = tanhf(inner);
            float d_inner = SQRT_2_OVER_PI * (1.0f + 3.0f * GELU_COEFF * x * x);
            return 0.5f * (1.0f + t) + 0.5f * x * (1.0f - t * t) * d_inner;
        }
        case 6: { float s = sigmoid_f(x); return s * (1.0f + x * (1.0f - s)); }
        default: return QNAN;
    }
}

__device__ __forceinline__ float row_dot(const float* a, int a_off, const float* b, int b_off, int len) {
    float acc = 0.0f;
    for (int p = 0; p < len; ++p) acc += a[a_off + p] * b[b_off + p];
    return acc;
}
"#;

/// Every program shipped with the library, in registration order.
pub static PROGRAMS: &[&Program] = &[
    &fill::PROGRAM,
    &elementwise::PROGRAM,
    &reduce::PROGRAM,
    &matmul::PROGRAM,
    &layout::PROGRAM,
    &norm::PROGRAM,
    &conv::PROGRAM,
    &attention::PROGRAM,
];

/// The bundled program at resource path `path`.
pub fn bundled(path: &str) -> Option<&'static Program> {
    PROGRAMS.iter().copied().find(|p| p.path == path)
}

// Shared kernel-side helpers

#[inline]
pub(crate) fn binary_op(code: i32) -> Access<BinaryOp> {
    BinaryOp::from_code(code).ok_or(AccessFault::Code { value: code })
}

#[inline]
pub(crate) fn activation(code: i32, param: f32) -> Access<Activation> {
    Activation::decode(code, param).ok_or(AccessFault::Code { value: code })
}

/// Read the first `len` entries of an index buffer.
pub(crate) fn read_indices(buffer: &Cells, len: usize) -> Access<Vec<usize>> {
    (0..len).map(|i| buffer.index(i)).collect()
}

/// Dot product of `len` elements starting at `a_off` and `b_off`.
#[inline]
pub(crate) fn dot(a: &Cells, a_off: usize, b: &Cells, b_off: usize, len: usize) -> Access<f32> {
    let mut acc = 0.0f32;
    for p in 0..len {
        acc += a.load(a_off + p)? * b.load(b_off + p)?;
    }
    Ok(acc)
}
