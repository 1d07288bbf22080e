use std::fmt;

use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use crate::slice::ResolvedRange;

// Backend — abstraction over where tensor data lives and how kernels run
//
// The host backend keeps storage in process memory and runs kernels on the
// rayon pool; the device backend keeps storage in device buffers and submits
// named kernels to a command queue. `Tensor<B>` is generic over the backend
// and dispatches every computation through this trait.
//
// All compute methods take the device handle first so a backend can consult
// its own configuration (thresholds, work-group sizes) without globals.
// Storage is always f32.

/// Identifies a compute device (e.g., "cpu", "device:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Send + Sync + 'static {
    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline(always)]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    /// Stable numeric code, used as a scalar kernel argument.
    pub fn code(self) -> i32 {
        match self {
            BinaryOp::Add => 0,
            BinaryOp::Sub => 1,
            BinaryOp::Mul => 2,
            BinaryOp::Div => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BinaryOp::Add),
            1 => Some(BinaryOp::Sub),
            2 => Some(BinaryOp::Mul),
            3 => Some(BinaryOp::Div),
            _ => None,
        }
    }
}

/// Element-wise activation functions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Identity,
    Relu,
    LeakyRelu { alpha: f32 },
    Sigmoid,
    Tanh,
    /// tanh approximation: 0.5·x·(1 + tanh(√(2/π)·(x + 0.044715·x³)))
    Gelu,
    Silu,
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

#[inline(always)]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation {
    /// f(x)
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Gelu => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
            Activation::Silu => x * sigmoid(x),
        }
    }

    /// f'(x), evaluated at the forward input.
    #[inline]
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu { alpha } => {
                if x > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid(x);
                s * (1.0 - s)
            }
            Activation::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            Activation::Gelu => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                let t = inner.tanh();
                let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            }
            Activation::Silu => {
                let s = sigmoid(x);
                s * (1.0 + x * (1.0 - s))
            }
        }
    }

    /// (code, parameter) pair for passing through scalar kernel arguments.
    pub fn encode(self) -> (i32, f32) {
        match self {
            Activation::Identity => (0, 0.0),
            Activation::Relu => (1, 0.0),
            Activation::LeakyRelu { alpha } => (2, alpha),
            Activation::Sigmoid => (3, 0.0),
            Activation::Tanh => (4, 0.0),
            Activation::Gelu => (5, 0.0),
            Activation::Silu => (6, 0.0),
        }
    }

    pub fn decode(code: i32, param: f32) -> Option<Self> {
        Some(match code {
            0 => Activation::Identity,
            1 => Activation::Relu,
            2 => Activation::LeakyRelu { alpha: param },
            3 => Activation::Sigmoid,
            4 => Activation::Tanh,
            5 => Activation::Gelu,
            6 => Activation::Silu,
            _ => return None,
        })
    }
}

/// 2-D convolution hyper-parameters (NCHW input, [C_out, C_in, kH, kW] weight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Conv2dParams {
            stride: [1, 1],
            padding: [0, 0],
        }
    }
}

impl Conv2dParams {
    /// Output spatial size for an input of `h`×`w` and a `kh`×`kw` kernel.
    pub fn output_hw(&self, h: usize, w: usize, kh: usize, kw: usize) -> Option<(usize, usize)> {
        let hp = h + 2 * self.padding[0];
        let wp = w + 2 * self.padding[1];
        if kh == 0 || kw == 0 || hp < kh || wp < kw || self.stride[0] == 0 || self.stride[1] == 0 {
            return None;
        }
        Some(((hp - kh) / self.stride[0] + 1, (wp - kw) / self.stride[1] + 1))
    }
}

/// 2-D max-pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pool2dParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
}

impl Pool2dParams {
    /// Square window with stride equal to its size.
    pub fn square(k: usize) -> Self {
        Pool2dParams {
            kernel: [k, k],
            stride: [k, k],
        }
    }

    pub fn output_hw(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let [kh, kw] = self.kernel;
        if kh == 0 || kw == 0 || h < kh || w < kw || self.stride[0] == 0 || self.stride[1] == 0 {
            return None;
        }
        Some(((h - kh) / self.stride[0] + 1, (w - kw) / self.stride[1] + 1))
    }
}

/// Parameters of scaled dot-product attention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    pub causal: bool,
    /// Score multiplier; 1/√head_dim unless overridden.
    pub scale: f32,
}

impl AttentionParams {
    pub fn new(head_dim: usize, causal: bool) -> Self {
        AttentionParams {
            causal,
            scale: 1.0 / (head_dim.max(1) as f32).sqrt(),
        }
    }

    /// Whether key `j` is visible from query `i` (causal masks align the
    /// last query with the last key).
    #[inline]
    pub fn visible(&self, i: usize, j: usize, seq_q: usize, seq_k: usize) -> bool {
        !self.causal || j + seq_q <= i + seq_k
    }
}

/// Storage + layout pair.
pub type Operand<'a, S> = (&'a S, &'a Layout);

/// Operands of a fused attention call: query/key/value as
/// [batch..., seq, head_dim].
pub struct AttentionOperands<'a, S> {
    pub q: Operand<'a, S>,
    pub k: Operand<'a, S>,
    pub v: Operand<'a, S>,
}

/// Saved forward results and incoming gradient for fused attention backward.
pub struct AttentionBackwardOperands<'a, S> {
    pub inputs: AttentionOperands<'a, S>,
    pub output: Operand<'a, S>,
    /// Per-row log-sum-exp of the scaled scores, [batch..., seq_q].
    pub lse: Operand<'a, S>,
    pub grad: Operand<'a, S>,
}

/// Gradients for query, key and value from a fused backward pass.
pub struct AttentionGrads<S> {
    pub dq: S,
    pub dk: S,
    pub dv: S,
}

// Backend Trait — The core interface every backend must implement

/// A complete compute backend.
///
/// Operations take storage + layout and return fresh contiguous storage,
/// except the `*_inplace` / `*_accumulate` methods which write into their
/// first operand.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    /// Whether transposes, permutes and reshapes may share storage with
    /// their source. When false every view is materialized by a copy.
    const ALIASING_VIEWS: bool;

    //  Creation

    fn zeros(device: &Self::Device, shape: &Shape) -> Result<Self::Storage>;

    fn full(device: &Self::Device, shape: &Shape, value: f32) -> Result<Self::Storage>;

    /// Storage holding `data` in row-major order for `shape`.
    fn from_vec(device: &Self::Device, data: Vec<f32>, shape: &Shape) -> Result<Self::Storage>;

    /// Uniform values in [0, 1). A seed makes the draw reproducible.
    fn rand_uniform(device: &Self::Device, shape: &Shape, seed: Option<u64>)
        -> Result<Self::Storage>;

    /// Standard normal values (mean 0, std 1).
    fn rand_normal(device: &Self::Device, shape: &Shape, seed: Option<u64>)
        -> Result<Self::Storage>;

    //  Data movement

    /// Logical contents in row-major order, copied to the host.
    fn to_vec(device: &Self::Device, input: &Self::Storage, layout: &Layout) -> Result<Vec<f32>>;

    fn read_element(device: &Self::Device, input: &Self::Storage, position: usize) -> Result<f32>;

    fn write_element(
        device: &Self::Device,
        input: &mut Self::Storage,
        position: usize,
        value: f32,
    ) -> Result<()>;

    /// Copy the logical contents of `(input, layout)` into fresh contiguous
    /// storage described by `shape` (same element count).
    fn materialize(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
        shape: &Shape,
    ) -> Result<Self::Storage>;

    fn to_contiguous(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
    ) -> Result<Self::Storage> {
        Self::materialize(device, input, layout, layout.shape())
    }

    //  Element-wise

    /// result = op(lhs, rhs) at the broadcast shape of both operands.
    fn binary_op(
        device: &Self::Device,
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// lhs = op(lhs, rhs) where rhs broadcasts into lhs's contiguous shape.
    fn binary_op_inplace(
        device: &Self::Device,
        op: BinaryOp,
        lhs: &mut Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<()>;

    /// result = op(input, scalar)
    fn scalar_op(
        device: &Self::Device,
        op: BinaryOp,
        input: &Self::Storage,
        layout: &Layout,
        scalar: f32,
    ) -> Result<Self::Storage>;

    fn activation(
        device: &Self::Device,
        act: Activation,
        input: &Self::Storage,
        layout: &Layout,
    ) -> Result<Self::Storage>;

    /// grad · f'(input)
    fn activation_backward(
        device: &Self::Device,
        act: Activation,
        input: &Self::Storage,
        input_layout: &Layout,
        grad: &Self::Storage,
        grad_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Reductions

    /// Sum `input` down to `target`, which must broadcast to the input shape.
    /// Axes that were stretched by broadcasting are summed; a scalar target
    /// sums everything.
    fn sum_to_shape(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
        target: &Shape,
    ) -> Result<Self::Storage>;

    /// Softmax along the last axis.
    fn softmax(device: &Self::Device, input: &Self::Storage, layout: &Layout)
        -> Result<Self::Storage>;

    /// y·(g − Σ g·y) along the last axis, given the softmax output y.
    fn softmax_backward(
        device: &Self::Device,
        output: &Self::Storage,
        output_layout: &Layout,
        grad: &Self::Storage,
        grad_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// (x − mean) / √(var + eps) along the last axis.
    fn layer_norm(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
        eps: f32,
    ) -> Result<Self::Storage>;

    /// Input gradient of the normalization given the gradient w.r.t. the
    /// normalized values.
    fn layer_norm_backward(
        device: &Self::Device,
        input: &Self::Storage,
        input_layout: &Layout,
        grad: &Self::Storage,
        grad_layout: &Layout,
        eps: f32,
    ) -> Result<Self::Storage>;

    //  Linear algebra

    /// Batched matrix product with broadcast batch dims; `out_shape` is
    /// batch ++ [m, n].
    fn matmul(
        device: &Self::Device,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<Self::Storage>;

    fn conv2d(
        device: &Self::Device,
        input: &Self::Storage,
        input_layout: &Layout,
        weight: &Self::Storage,
        weight_layout: &Layout,
        params: &Conv2dParams,
    ) -> Result<Self::Storage>;

    fn conv2d_backward_input(
        device: &Self::Device,
        grad: &Self::Storage,
        grad_layout: &Layout,
        weight: &Self::Storage,
        weight_layout: &Layout,
        input_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<Self::Storage>;

    fn conv2d_backward_weight(
        device: &Self::Device,
        grad: &Self::Storage,
        grad_layout: &Layout,
        input: &Self::Storage,
        input_layout: &Layout,
        weight_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<Self::Storage>;

    fn max_pool2d(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<Self::Storage>;

    /// Route each window's gradient to the first maximal element of that window.
    fn max_pool2d_backward(
        device: &Self::Device,
        input: &Self::Storage,
        input_layout: &Layout,
        grad: &Self::Storage,
        grad_layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<Self::Storage>;

    //  Structural

    fn slice(
        device: &Self::Device,
        input: &Self::Storage,
        layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<Self::Storage>;

    /// dst[ranges] += src, where dst is contiguous over `dst_shape`.
    fn slice_accumulate(
        device: &Self::Device,
        dst: &mut Self::Storage,
        dst_shape: &Shape,
        src: &Self::Storage,
        src_layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<()>;

    fn concat(
        device: &Self::Device,
        inputs: &[Operand<'_, Self::Storage>],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    //  Fused kernels

    /// Fused attention forward. Returns (output, log-sum-exp), or `None` when
    /// this backend has no fused path.
    fn flash_attention(
        _device: &Self::Device,
        _operands: AttentionOperands<'_, Self::Storage>,
        _params: &AttentionParams,
    ) -> Result<Option<(Self::Storage, Self::Storage)>> {
        Ok(None)
    }

    fn flash_attention_backward(
        _device: &Self::Device,
        _operands: AttentionBackwardOperands<'_, Self::Storage>,
        _params: &AttentionParams,
    ) -> Result<Option<AttentionGrads<Self::Storage>>> {
        Ok(None)
    }
}
