// Operation — the catalogue of differentiable operations
//
// Every tensor produced by a `*_grad` call while gradients are being tracked
// records one `Operation` together with its input tensors. An operation
// knows three things:
//
//   required_inputs()   how many inputs it consumes
//   forward(inputs)     how to compute its output (plus any state it must
//                       keep for backward)
//   backward(grad, ..)  how to map the output gradient to one gradient per
//                       input (the chain rule)
//
// GRADIENT RULES:
//
//   Add:          gA = reduce(g),        gB = reduce(g)
//   Sub:          gA = reduce(g),        gB = reduce(−g)
//   Mul:          gA = reduce(g·B),      gB = reduce(g·A)
//   Div:          gA = reduce(g/B),      gB = reduce(−g·A/B²)
//   MatMul:       gA = reduce(g @ Bᵀ),   gB = reduce(Aᵀ @ g)
//   Convolve:     input/weight gradients from the transposed convolution
//   MaxPool:      g routed to the first maximal element of each window
//   Slice:        g scattered into zeros of the input shape
//   Concat:       g sliced back into per-input pieces
//   Squeeze / Unsqueeze / Reshape:   g reshaped to the input shape
//   Transpose / Permute:             g permuted back
//   Activation:   g·f'(x)
//   Softmax:      y·(g − Σ g·y)
//   LayerNorm:    gScale = Σ g·x̂, gBias = Σ g, gX per LayerNormGradMode
//   FlashAttention: fused backward kernel
//   Scale:        g·factor
//   Sum / Mean:   g broadcast to the input shape (÷ n for Mean)
//
// reduce(·) sums away the axes that broadcasting stretched, so every input
// gradient has exactly its input's shape.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{Activation, AttentionParams, Backend, BinaryOp, Conv2dParams, Pool2dParams};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::slice::SliceRange;
use crate::tensor::Tensor;

/// Unique identifier for a tensor, used to key gradients during backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// How the input gradient of LayerNorm is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayerNormGradMode {
    /// Pass the upstream gradient through to the input unchanged.
    #[default]
    Reference,
    /// The full analytic gradient of the normalization.
    Exact,
}

/// Number of inputs an operation consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArity {
    Exactly(usize),
    AtLeast(usize),
}

impl InputArity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            InputArity::Exactly(k) => n == k,
            InputArity::AtLeast(k) => n >= k,
        }
    }

    fn count(self) -> usize {
        match self {
            InputArity::Exactly(k) | InputArity::AtLeast(k) => k,
        }
    }
}

/// A differentiable operation recorded in the autograd graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    /// 2-D convolution of (input, weight).
    Convolve(Conv2dParams),
    MaxPool(Pool2dParams),
    Slice(Vec<SliceRange>),
    Concat { dim: usize },
    /// Remove one size-1 dim, or every size-1 dim when `None`.
    Squeeze { dim: Option<usize> },
    Unsqueeze { dim: usize },
    Reshape(Shape),
    Transpose { dim0: usize, dim1: usize },
    Permute(Vec<usize>),
    Activation(Activation),
    Softmax,
    /// Normalize the last axis of (input, scale, bias).
    LayerNorm { eps: f32, mode: LayerNormGradMode },
    /// Fused attention over (query, key, value).
    FlashAttention(AttentionParams),
    Scale { factor: f32 },
    Sum,
    Mean,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Sub => "sub",
            Operation::Mul => "mul",
            Operation::Div => "div",
            Operation::MatMul => "matmul",
            Operation::Convolve(_) => "convolve",
            Operation::MaxPool(_) => "max_pool",
            Operation::Slice(_) => "slice",
            Operation::Concat { .. } => "concat",
            Operation::Squeeze { .. } => "squeeze",
            Operation::Unsqueeze { .. } => "unsqueeze",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose { .. } => "transpose",
            Operation::Permute(_) => "permute",
            Operation::Activation(_) => "activation",
            Operation::Softmax => "softmax",
            Operation::LayerNorm { .. } => "layer_norm",
            Operation::FlashAttention(_) => "flash_attention",
            Operation::Scale { .. } => "scale",
            Operation::Sum => "sum",
            Operation::Mean => "mean",
        }
    }

    pub fn required_inputs(&self) -> InputArity {
        match self {
            Operation::Add
            | Operation::Sub
            | Operation::Mul
            | Operation::Div
            | Operation::MatMul
            | Operation::Convolve(_) => InputArity::Exactly(2),
            Operation::LayerNorm { .. } | Operation::FlashAttention(_) => InputArity::Exactly(3),
            Operation::Concat { .. } => InputArity::AtLeast(1),
            _ => InputArity::Exactly(1),
        }
    }

    fn check_inputs(&self, got: usize) -> Result<()> {
        let arity = self.required_inputs();
        if arity.accepts(got) {
            Ok(())
        } else {
            Err(Error::WrongInputCount {
                op: self.name(),
                expected: arity.count(),
                got,
            })
        }
    }

    /// Compute the output of this operation without recording anything.
    pub fn compute<B: Backend>(&self, inputs: &[&Tensor<B>]) -> Result<Tensor<B>> {
        Ok(self.forward(inputs)?.0)
    }

    /// Compute the output together with the tensors backward will need
    /// beyond the inputs themselves.
    pub fn forward<B: Backend>(&self, inputs: &[&Tensor<B>]) -> Result<(Tensor<B>, Vec<Tensor<B>>)> {
        self.check_inputs(inputs.len())?;
        let x = inputs[0];
        let out = match self {
            Operation::Add => x.binary(BinaryOp::Add, inputs[1])?,
            Operation::Sub => x.binary(BinaryOp::Sub, inputs[1])?,
            Operation::Mul => x.binary(BinaryOp::Mul, inputs[1])?,
            Operation::Div => x.binary(BinaryOp::Div, inputs[1])?,
            Operation::MatMul => x.matmul(inputs[1])?,
            Operation::Convolve(p) => x.conv2d(inputs[1], *p)?,
            Operation::MaxPool(p) => x.max_pool2d(*p)?,
            Operation::Slice(ranges) => x.slice(ranges)?,
            Operation::Concat { dim } => Tensor::concat(inputs, *dim)?,
            Operation::Squeeze { dim: Some(d) } => x.squeeze(*d)?,
            Operation::Squeeze { dim: None } => x.squeeze_all()?,
            Operation::Unsqueeze { dim } => x.unsqueeze(*dim)?,
            Operation::Reshape(shape) => x.reshape(shape.clone())?,
            Operation::Transpose { dim0, dim1 } => x.transpose(*dim0, *dim1)?,
            Operation::Permute(dims) => x.permute(dims)?,
            Operation::Activation(act) => x.activation(*act)?,
            Operation::Softmax => x.softmax()?,
            Operation::LayerNorm { eps, .. } => x.layer_norm(inputs[1], inputs[2], *eps)?,
            Operation::FlashAttention(p) => {
                return match x.fused_attention(inputs[1], inputs[2], p)? {
                    Some((out, lse)) => {
                        let saved = vec![out.detach(), lse];
                        Ok((out, saved))
                    }
                    None => Ok((
                        x.scaled_dot_product_attention_with(inputs[1], inputs[2], p)?,
                        Vec::new(),
                    )),
                };
            }
            Operation::Scale { factor } => x.mul_scalar(*factor)?,
            Operation::Sum => x.sum_all()?,
            Operation::Mean => x.mean_all()?,
        };
        Ok((out, Vec::new()))
    }

    /// Map the output gradient to one gradient per input.
    pub fn backward<B: Backend>(
        &self,
        grad: &Tensor<B>,
        inputs: &[&Tensor<B>],
        saved: &[Tensor<B>],
    ) -> Result<Vec<Tensor<B>>> {
        self.check_inputs(inputs.len())?;
        let x = inputs[0];
        let grads = match self {
            Operation::Add => vec![
                grad.sum_to_shape(x.shape())?,
                grad.sum_to_shape(inputs[1].shape())?,
            ],
            Operation::Sub => vec![
                grad.sum_to_shape(x.shape())?,
                grad.mul_scalar(-1.0)?.sum_to_shape(inputs[1].shape())?,
            ],
            Operation::Mul => {
                let b = inputs[1];
                vec![
                    grad.binary(BinaryOp::Mul, b)?.sum_to_shape(x.shape())?,
                    grad.binary(BinaryOp::Mul, x)?.sum_to_shape(b.shape())?,
                ]
            }
            Operation::Div => {
                let b = inputs[1];
                let ga = grad.binary(BinaryOp::Div, b)?;
                // −g·a/b² = −(g/b)·(a/b)
                let gb = ga.binary(BinaryOp::Mul, &x.binary(BinaryOp::Div, b)?)?.mul_scalar(-1.0)?;
                vec![ga.sum_to_shape(x.shape())?, gb.sum_to_shape(b.shape())?]
            }
            Operation::MatMul => {
                let b = inputs[1];
                let ga = grad.matmul(&b.t()?)?;
                let gb = x.t()?.matmul(grad)?;
                vec![ga.sum_to_shape(x.shape())?, gb.sum_to_shape(b.shape())?]
            }
            Operation::Convolve(p) => {
                let w = inputs[1];
                vec![
                    grad.conv2d_backward_input(w, x.shape(), p)?,
                    grad.conv2d_backward_weight(x, w.shape(), p)?,
                ]
            }
            Operation::MaxPool(p) => vec![x.max_pool2d_backward(grad, p)?],
            Operation::Slice(ranges) => vec![grad.slice_backward(x.shape(), ranges)?],
            Operation::Concat { dim } => {
                let mut start = 0;
                let mut pieces = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let len = input.shape().dim(*dim)?;
                    let mut ranges = vec![SliceRange::all(); *dim];
                    ranges.push(SliceRange::interval(start, start + len));
                    pieces.push(grad.slice(&ranges)?);
                    start += len;
                }
                pieces
            }
            Operation::Squeeze { .. } | Operation::Unsqueeze { .. } | Operation::Reshape(_) => {
                vec![grad.reshape(x.shape().clone())?]
            }
            Operation::Transpose { dim0, dim1 } => vec![grad.transpose(*dim0, *dim1)?],
            Operation::Permute(dims) => {
                let mut inverse = vec![0; dims.len()];
                for (i, &d) in dims.iter().enumerate() {
                    inverse[d] = i;
                }
                vec![grad.permute(&inverse)?]
            }
            Operation::Activation(act) => vec![x.activation_backward(*act, grad)?],
            Operation::Softmax => vec![x.softmax()?.softmax_backward(grad)?],
            Operation::LayerNorm { eps, mode } => {
                let (scale, bias) = (inputs[1], inputs[2]);
                let normalized = x.normalize(*eps)?;
                let g_scale = grad
                    .binary(BinaryOp::Mul, &normalized)?
                    .sum_to_shape(scale.shape())?;
                let g_bias = grad.sum_to_shape(bias.shape())?;
                let g_x = match mode {
                    LayerNormGradMode::Reference => grad.clone(),
                    LayerNormGradMode::Exact => {
                        x.normalize_backward(&grad.binary(BinaryOp::Mul, scale)?, *eps)?
                    }
                };
                vec![g_x, g_scale, g_bias]
            }
            Operation::FlashAttention(p) => {
                let [out, lse] = saved else {
                    return Err(Error::InvalidState(
                        "flash attention backward needs the saved output and log-sum-exp".into(),
                    ));
                };
                let (dq, dk, dv) = x
                    .fused_attention_backward(inputs[1], inputs[2], out, lse, grad, p)?
                    .ok_or_else(|| {
                        Error::InvalidState("fused attention backward is not available".into())
                    })?;
                vec![dq, dk, dv]
            }
            Operation::Scale { factor } => vec![grad.mul_scalar(*factor)?],
            Operation::Sum => vec![grad.broadcast_to(x.shape())?],
            Operation::Mean => {
                let n = x.elem_count().max(1) as f32;
                vec![grad.broadcast_to(x.shape())?.mul_scalar(1.0 / n)?]
            }
        };
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = TensorId::new();
        let b = TensorId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn arity() {
        assert_eq!(Operation::Add.required_inputs(), InputArity::Exactly(2));
        assert_eq!(
            Operation::LayerNorm {
                eps: 1e-5,
                mode: LayerNormGradMode::Exact
            }
            .required_inputs(),
            InputArity::Exactly(3)
        );
        assert!(Operation::Concat { dim: 0 }.required_inputs().accepts(4));
        assert!(!Operation::Sum.required_inputs().accepts(2));
    }
}
