// Graph-building operations
//
// Each `*_grad` method computes the same value as its plain counterpart, but
// out of place, and records an `Operation` node on the output whenever any
// input requires gradients. With no tracked input they simply return a new,
// untracked tensor.

use crate::autograd::record;
use crate::backend::{Activation, Backend, Conv2dParams, Pool2dParams};
use crate::error::Result;
use crate::op::{LayerNormGradMode, Operation};
use crate::shape::Shape;
use crate::slice::SliceRange;
use crate::tensor::Tensor;

fn apply<B: Backend>(op: Operation, inputs: &[&Tensor<B>]) -> Result<Tensor<B>> {
    let (out, saved) = op.forward(inputs)?;
    record(out, op, inputs, saved)
}

impl<B: Backend> Tensor<B> {
    /// Run any catalogue operation with graph recording.
    pub fn apply_op(op: Operation, inputs: &[&Self]) -> Result<Self> {
        apply(op, inputs)
    }

    pub fn add_grad(&self, rhs: &Self) -> Result<Self> {
        apply(Operation::Add, &[self, rhs])
    }

    pub fn sub_grad(&self, rhs: &Self) -> Result<Self> {
        apply(Operation::Sub, &[self, rhs])
    }

    pub fn mul_grad(&self, rhs: &Self) -> Result<Self> {
        apply(Operation::Mul, &[self, rhs])
    }

    pub fn div_grad(&self, rhs: &Self) -> Result<Self> {
        apply(Operation::Div, &[self, rhs])
    }

    pub fn matmul_grad(&self, rhs: &Self) -> Result<Self> {
        apply(Operation::MatMul, &[self, rhs])
    }

    pub fn conv2d_grad(&self, weight: &Self, params: Conv2dParams) -> Result<Self> {
        apply(Operation::Convolve(params), &[self, weight])
    }

    pub fn max_pool2d_grad(&self, params: Pool2dParams) -> Result<Self> {
        apply(Operation::MaxPool(params), &[self])
    }

    pub fn slice_grad(&self, ranges: &[SliceRange]) -> Result<Self> {
        apply(Operation::Slice(ranges.to_vec()), &[self])
    }

    pub fn concat_grad(tensors: &[&Self], dim: usize) -> Result<Self> {
        apply(Operation::Concat { dim }, tensors)
    }

    pub fn squeeze_grad(&self, dim: usize) -> Result<Self> {
        apply(Operation::Squeeze { dim: Some(dim) }, &[self])
    }

    pub fn squeeze_all_grad(&self) -> Result<Self> {
        apply(Operation::Squeeze { dim: None }, &[self])
    }

    pub fn unsqueeze_grad(&self, dim: usize) -> Result<Self> {
        apply(Operation::Unsqueeze { dim }, &[self])
    }

    pub fn reshape_grad(&self, shape: impl Into<Shape>) -> Result<Self> {
        apply(Operation::Reshape(shape.into()), &[self])
    }

    pub fn transpose_grad(&self, dim0: usize, dim1: usize) -> Result<Self> {
        apply(Operation::Transpose { dim0, dim1 }, &[self])
    }

    /// Transpose of the last two dimensions.
    pub fn t_grad(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(crate::Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.transpose_grad(rank - 2, rank - 1)
    }

    pub fn permute_grad(&self, dims: &[usize]) -> Result<Self> {
        apply(Operation::Permute(dims.to_vec()), &[self])
    }

    pub fn activation_grad(&self, act: Activation) -> Result<Self> {
        apply(Operation::Activation(act), &[self])
    }

    pub fn relu_grad(&self) -> Result<Self> {
        self.activation_grad(Activation::Relu)
    }

    pub fn sigmoid_grad(&self) -> Result<Self> {
        self.activation_grad(Activation::Sigmoid)
    }

    pub fn tanh_grad(&self) -> Result<Self> {
        self.activation_grad(Activation::Tanh)
    }

    pub fn softmax_grad(&self) -> Result<Self> {
        apply(Operation::Softmax, &[self])
    }

    pub fn layer_norm_grad(&self, scale: &Self, bias: &Self, eps: f32) -> Result<Self> {
        self.layer_norm_grad_with(scale, bias, eps, LayerNormGradMode::default())
    }

    pub fn layer_norm_grad_with(
        &self,
        scale: &Self,
        bias: &Self,
        eps: f32,
        mode: LayerNormGradMode,
    ) -> Result<Self> {
        apply(Operation::LayerNorm { eps, mode }, &[self, scale, bias])
    }

    pub fn scale_grad(&self, factor: f32) -> Result<Self> {
        apply(Operation::Scale { factor }, &[self])
    }

    pub fn sum_grad(&self) -> Result<Self> {
        apply(Operation::Sum, &[self])
    }

    pub fn mean_grad(&self) -> Result<Self> {
        apply(Operation::Mean, &[self])
    }

    /// Fused attention recorded as a single node; `None` when the backend
    /// has no fused path.
    pub fn flash_attention_grad(&self, key: &Self, value: &Self, causal: bool) -> Result<Option<Self>> {
        let params = self.attention_params(causal)?;
        let Some((out, lse)) = self.fused_attention(key, value, &params)? else {
            return Ok(None);
        };
        let saved = vec![out.detach(), lse];
        let out = record(
            out,
            Operation::FlashAttention(params),
            &[self, key, value],
            saved,
        )?;
        Ok(Some(out))
    }

    /// Attention built from recorded primitive ops.
    pub fn scaled_dot_product_attention_grad(
        &self,
        key: &Self,
        value: &Self,
        causal: bool,
    ) -> Result<Self> {
        let params = self.attention_params(causal)?;
        let mut scores = self.matmul_grad(&key.t_grad()?)?.scale_grad(params.scale)?;
        if causal {
            scores = scores.add_grad(&self.causal_mask(key)?)?;
        }
        scores.softmax_grad()?.matmul_grad(value)
    }

    /// Fused attention when available, the primitive-op graph otherwise.
    pub fn attention_grad(&self, key: &Self, value: &Self, causal: bool) -> Result<Self> {
        match self.flash_attention_grad(key, value, causal)? {
            Some(out) => Ok(out),
            None => self.scaled_dot_product_attention_grad(key, value, causal),
        }
    }
}
