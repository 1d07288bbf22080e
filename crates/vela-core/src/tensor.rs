use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::autograd::{self, AutogradContext, BackwardOptions};
use crate::backend::{
    Activation, AttentionBackwardOperands, AttentionOperands, AttentionParams, Backend, BinaryOp,
    Conv2dParams, Pool2dParams,
};
use crate::bail;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Operation, TensorId};
use crate::shape::Shape;
use crate::slice::{resolve_ranges, sliced_shape, SliceRange};

// Tensor — n-dimensional f32 array on a backend
//
//   Tensor<B: Backend> is generic over where the data lives:
//     - Tensor<CpuBackend> keeps data in host memory
//     - Tensor<DeviceBackend> keeps data in device buffers
//
// MEMORY MODEL:
//
//   A Tensor is a cheap handle (Arc) to an inner record holding an id, a
//   layout, and an Arc<RwLock<Storage>>. Views made by transpose, permute and
//   reshape of contiguous data get a new inner record that points at the same
//   storage, so writes through one are visible through the other. Backends
//   whose storage cannot alias (ALIASING_VIEWS = false) materialize every view.
//
// ARITHMETIC:
//
//   add / sub / mul / div mutate the receiver in place; the right-hand side
//   must broadcast into the receiver's shape. Everything else returns a new
//   tensor. The `*_grad` variants (see grad_ops.rs) compute the same results
//   out of place and record the operation for autograd.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    device: B::Device,
    autograd: RwLock<Option<Arc<AutogradContext<B>>>>,
}

/// An n-dimensional array of f32 on a specific backend.
///
/// # Example
/// ```ignore
/// use vela_core::Tensor;
/// use vela_cpu::{CpuBackend, CpuDevice};
///
/// let dev = CpuDevice::default();
/// let a = Tensor::<CpuBackend>::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
/// let b = Tensor::<CpuBackend>::ones(2, &dev)?;
/// a.add(&b)?; // a is now [[2, 3], [4, 5]]
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, device={:?}, requires_grad={})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.device,
            self.requires_grad(),
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(storage: B::Storage, layout: Layout, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                device,
                autograd: RwLock::new(None),
            }),
        }
    }

    fn contiguous_storage(storage: B::Storage, shape: Shape, device: &B::Device) -> Self {
        Self::from_storage(storage, Layout::contiguous(shape), device.clone())
    }

    /// A new tensor record sharing this tensor's storage.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                device: self.inner.device.clone(),
                autograd: RwLock::new(None),
            }),
        }
    }

    /// Present the same elements under `layout`: a view when the backend can
    /// alias storage, a copy otherwise.
    fn relayout(&self, layout: Layout) -> Result<Self> {
        if B::ALIASING_VIEWS {
            return Ok(self.view_with_layout(layout));
        }
        let shape = layout.shape().clone();
        let storage = {
            let src = self.storage()?;
            B::materialize(self.device(), &src, &layout, &shape)?
        };
        Ok(Self::contiguous_storage(storage, shape, self.device()))
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn strides(&self) -> &[usize] {
        self.inner.layout.strides()
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor is a transposed/permuted view of its storage.
    pub fn is_transposed(&self) -> bool {
        self.inner.layout.is_transposed()
    }

    /// Whether both tensors read and write the same storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Access the underlying storage (read lock).
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::LockPoisoned("tensor storage"))
    }

    fn storage_mut(&self) -> Result<RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::LockPoisoned("tensor storage"))
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(device, &shape)?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    pub fn ones(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, device)
    }

    pub fn full(shape: impl Into<Shape>, value: f32, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(device, &shape, value)?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    /// A rank-0 tensor holding `value`.
    pub fn scalar(value: f32, device: &B::Device) -> Result<Self> {
        Self::from_vec(vec![value], (), device)
    }

    /// Build a tensor from row-major data.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_vec(device, data, &shape)?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    pub fn from_slice(data: &[f32], shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape, device)
    }

    /// [0, 1, ..., n-1]
    pub fn arange(n: usize, device: &B::Device) -> Result<Self> {
        Self::from_vec((0..n).map(|i| i as f32).collect(), n, device)
    }

    /// Uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(device, &shape, None)?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    /// Standard normal values.
    pub fn randn(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(device, &shape, None)?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    /// Reproducible uniform values.
    pub fn rand_seeded(shape: impl Into<Shape>, seed: u64, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(device, &shape, Some(seed))?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    /// Reproducible standard normal values.
    pub fn randn_seeded(shape: impl Into<Shape>, seed: u64, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(device, &shape, Some(seed))?;
        Ok(Self::contiguous_storage(storage, shape, device))
    }

    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape().clone(), self.device())
    }

    pub fn ones_like(&self) -> Result<Self> {
        Self::ones(self.shape().clone(), self.device())
    }

    // Data access

    /// All elements in logical row-major order.
    pub fn data(&self) -> Result<Vec<f32>> {
        let storage = self.storage()?;
        B::to_vec(self.device(), &storage, self.layout())
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let storage = self.storage()?;
        let position = self.layout().flat_index(&vec![0; self.rank()])?;
        B::read_element(self.device(), &storage, position)
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let position = self.layout().flat_index(index)?;
        let storage = self.storage()?;
        B::read_element(self.device(), &storage, position)
    }

    /// Overwrite one element. Views sharing this storage see the change.
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        let position = self.layout().flat_index(index)?;
        let mut storage = self.storage_mut()?;
        B::write_element(self.device(), &mut storage, position, value)
    }

    /// Copy this tensor's data onto another backend. The copy does not
    /// carry autograd state.
    pub fn to_backend<B2: Backend>(&self, device: &B2::Device) -> Result<Tensor<B2>> {
        let data = self.data()?;
        Tensor::<B2>::from_vec(data, self.shape().clone(), device)
    }

    // Views and structural ops

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.layout().transpose(dim0, dim1)?;
        self.relayout(layout)
    }

    /// Swap the last two dimensions.
    pub fn t(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.transpose(rank - 2, rank - 1)
    }

    /// Reorder dimensions: output dim i is input dim `dims[i]`.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let layout = self.layout().permute(dims)?;
        self.relayout(layout)
    }

    /// Same elements under a new shape. Contiguous tensors are reshaped
    /// without copying; strided views are copied first.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        if B::ALIASING_VIEWS && self.is_contiguous() {
            return Ok(self.view_with_layout(Layout::contiguous(shape)));
        }
        let storage = {
            let src = self.storage()?;
            B::materialize(self.device(), &src, self.layout(), &shape)?
        };
        Ok(Self::contiguous_storage(storage, shape, self.device()))
    }

    /// Remove dimension `dim`, which must have size 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let size = self.shape().dim(dim)?;
        if size != 1 {
            bail!("squeeze: dim {dim} of {} has size {size}, expected 1", self.shape());
        }
        let mut dims = self.dims().to_vec();
        dims.remove(dim);
        self.reshape(dims)
    }

    /// Remove every size-1 dimension.
    pub fn squeeze_all(&self) -> Result<Self> {
        let dims: Vec<usize> = self.dims().iter().copied().filter(|&d| d != 1).collect();
        self.reshape(dims)
    }

    /// Insert a size-1 dimension at `dim` (0..=rank).
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        let mut dims = self.dims().to_vec();
        dims.insert(dim, 1);
        self.reshape(dims)
    }

    /// This tensor itself if contiguous, a contiguous copy otherwise.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.deep_clone()
    }

    /// A contiguous copy with its own storage and no autograd state.
    pub fn deep_clone(&self) -> Result<Self> {
        let storage = {
            let src = self.storage()?;
            B::to_contiguous(self.device(), &src, self.layout())?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    /// A handle on the same storage with no autograd state.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone())
    }

    /// Copy out a sub-tensor. Missing trailing ranges select whole dims.
    pub fn slice(&self, ranges: &[SliceRange]) -> Result<Self> {
        let resolved = resolve_ranges(self.shape(), ranges)?;
        let shape = sliced_shape(&resolved);
        let storage = {
            let src = self.storage()?;
            B::slice(self.device(), &src, self.layout(), &resolved)?
        };
        Ok(Self::contiguous_storage(storage, shape, self.device()))
    }

    /// Zeros of `input_shape` with this tensor added into `ranges`.
    pub(crate) fn slice_backward(&self, input_shape: &Shape, ranges: &[SliceRange]) -> Result<Self> {
        let resolved = resolve_ranges(input_shape, ranges)?;
        let mut dst = B::zeros(self.device(), input_shape)?;
        {
            let src = self.storage()?;
            B::slice_accumulate(
                self.device(),
                &mut dst,
                input_shape,
                &src,
                self.layout(),
                &resolved,
            )?;
        }
        Ok(Self::contiguous_storage(
            dst,
            input_shape.clone(),
            self.device(),
        ))
    }

    /// Join tensors along `dim`; all other dims must agree.
    pub fn concat(tensors: &[&Self], dim: usize) -> Result<Self> {
        let Some(first) = tensors.first() else {
            return Err(Error::WrongInputCount {
                op: "concat",
                expected: 1,
                got: 0,
            });
        };
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = 0;
        for t in tensors {
            if t.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: t.rank(),
                });
            }
            for (d, (&a, &b)) in first.dims().iter().zip(t.dims()).enumerate() {
                if d != dim && a != b {
                    return Err(Error::ShapeMismatch {
                        expected: first.shape().clone(),
                        got: t.shape().clone(),
                    });
                }
            }
            out_dims[dim] += t.dims()[dim];
        }
        let out_shape = Shape::new(out_dims);
        let guards = tensors
            .iter()
            .map(|t| t.storage())
            .collect::<Result<Vec<_>>>()?;
        let operands: Vec<_> = guards
            .iter()
            .zip(tensors)
            .map(|(g, t)| (&**g, t.layout()))
            .collect();
        let storage = B::concat(first.device(), &operands, &out_shape, dim)?;
        Ok(Self::contiguous_storage(storage, out_shape, first.device()))
    }

    // Element-wise arithmetic

    /// op(self, rhs) at the broadcast shape, as a new tensor.
    pub fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self> {
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let storage = {
            let lhs_storage = self.storage()?;
            let rhs_storage = rhs.storage()?;
            B::binary_op(
                self.device(),
                op,
                &lhs_storage,
                self.layout(),
                &rhs_storage,
                rhs.layout(),
            )?
        };
        Ok(Self::contiguous_storage(storage, out_shape, self.device()))
    }

    fn binary_inplace(&self, op: BinaryOp, rhs: &Self) -> Result<()> {
        if !rhs.shape().broadcasts_into(self.shape()) {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            });
        }
        // Reading and writing the same storage would need both locks at once.
        let rhs = if self.shares_storage(rhs) {
            rhs.deep_clone()?
        } else {
            rhs.clone()
        };
        let rhs_storage = rhs.storage()?;
        let mut lhs_storage = self.storage_mut()?;
        B::binary_op_inplace(
            self.device(),
            op,
            &mut lhs_storage,
            self.layout(),
            &rhs_storage,
            rhs.layout(),
        )
    }

    /// self += rhs (rhs broadcasts into self).
    pub fn add(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Add, rhs)
    }

    /// self -= rhs (rhs broadcasts into self).
    pub fn sub(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Sub, rhs)
    }

    /// self *= rhs (rhs broadcasts into self).
    pub fn mul(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Mul, rhs)
    }

    /// self /= rhs (rhs broadcasts into self).
    pub fn div(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Div, rhs)
    }

    fn scalar_map(&self, op: BinaryOp, value: f32) -> Result<Self> {
        let storage = {
            let src = self.storage()?;
            B::scalar_op(self.device(), op, &src, self.layout(), value)?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    pub fn mul_scalar(&self, factor: f32) -> Result<Self> {
        self.scalar_map(BinaryOp::Mul, factor)
    }

    pub fn add_scalar(&self, value: f32) -> Result<Self> {
        self.scalar_map(BinaryOp::Add, value)
    }

    // Activations

    pub fn activation(&self, act: Activation) -> Result<Self> {
        let storage = {
            let src = self.storage()?;
            B::activation(self.device(), act, &src, self.layout())?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    pub fn relu(&self) -> Result<Self> {
        self.activation(Activation::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.activation(Activation::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.activation(Activation::Tanh)
    }

    pub fn gelu(&self) -> Result<Self> {
        self.activation(Activation::Gelu)
    }

    pub fn silu(&self) -> Result<Self> {
        self.activation(Activation::Silu)
    }

    pub fn leaky_relu(&self, alpha: f32) -> Result<Self> {
        self.activation(Activation::LeakyRelu { alpha })
    }

    /// grad · f'(self)
    pub(crate) fn activation_backward(&self, act: Activation, grad: &Self) -> Result<Self> {
        let storage = {
            let x = self.storage()?;
            let g = grad.storage()?;
            B::activation_backward(self.device(), act, &x, self.layout(), &g, grad.layout())?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    // Reductions

    /// Sum away broadcast axes so the result has shape `target`.
    pub fn sum_to_shape(&self, target: &Shape) -> Result<Self> {
        if target == self.shape() {
            return Ok(self.clone());
        }
        self.reduce_to(target)
    }

    fn reduce_to(&self, target: &Shape) -> Result<Self> {
        if !target.broadcasts_into(self.shape()) {
            return Err(Error::NotBroadcastable {
                lhs: self.shape().clone(),
                rhs: target.clone(),
            });
        }
        let storage = {
            let src = self.storage()?;
            B::sum_to_shape(self.device(), &src, self.layout(), target)?
        };
        Ok(Self::contiguous_storage(
            storage,
            target.clone(),
            self.device(),
        ))
    }

    /// Repeat this tensor up to a larger broadcast shape.
    pub fn broadcast_to(&self, shape: &Shape) -> Result<Self> {
        if shape == self.shape() {
            return Ok(self.clone());
        }
        if !self.shape().broadcasts_into(shape) {
            return Err(Error::NotBroadcastable {
                lhs: shape.clone(),
                rhs: self.shape().clone(),
            });
        }
        Self::zeros(shape.clone(), self.device())?.binary(BinaryOp::Add, self)
    }

    /// Sum of all elements as a rank-0 tensor.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_to(&Shape::from(()))
    }

    /// Mean of all elements as a rank-0 tensor.
    pub fn mean_all(&self) -> Result<Self> {
        let n = self.elem_count().max(1) as f32;
        self.sum_all()?.mul_scalar(1.0 / n)
    }

    // Normalization

    /// Softmax along the last axis. Rows whose entries are all −∞ produce zeros.
    pub fn softmax(&self) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let storage = {
            let src = self.storage()?;
            B::softmax(self.device(), &src, self.layout())?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    /// Input gradient of softmax; `self` is the softmax output.
    pub(crate) fn softmax_backward(&self, grad: &Self) -> Result<Self> {
        let storage = {
            let y = self.storage()?;
            let g = grad.storage()?;
            B::softmax_backward(self.device(), &y, self.layout(), &g, grad.layout())?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    /// (x − mean) / √(var + eps) over the last axis.
    pub fn normalize(&self, eps: f32) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let storage = {
            let src = self.storage()?;
            B::layer_norm(self.device(), &src, self.layout(), eps)?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    pub(crate) fn normalize_backward(&self, grad: &Self, eps: f32) -> Result<Self> {
        let storage = {
            let x = self.storage()?;
            let g = grad.storage()?;
            B::layer_norm_backward(self.device(), &x, self.layout(), &g, grad.layout(), eps)?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    /// normalize(self)·scale + bias; scale and bias broadcast into self.
    pub fn layer_norm(&self, scale: &Self, bias: &Self, eps: f32) -> Result<Self> {
        for p in [scale, bias] {
            if !p.shape().broadcasts_into(self.shape()) {
                return Err(Error::ShapeMismatch {
                    expected: self.shape().clone(),
                    got: p.shape().clone(),
                });
            }
        }
        self.normalize(eps)?
            .binary(BinaryOp::Mul, scale)?
            .binary(BinaryOp::Add, bias)
    }

    // Linear algebra

    /// Batched matrix product [..., m, k] @ [..., k, n] → [..., m, n].
    /// Batch dims broadcast.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let (lhs_batch, m, k1) = self.shape().matrix_dims()?;
        let (rhs_batch, k2, n) = rhs.shape().matrix_dims()?;
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch = Shape::broadcast_shape(&Shape::from(lhs_batch), &Shape::from(rhs_batch))?;
        let mut dims = batch.dims().to_vec();
        dims.extend([m, n]);
        let out_shape = Shape::new(dims);
        let storage = {
            let a = self.storage()?;
            let b = rhs.storage()?;
            B::matmul(
                self.device(),
                &a,
                self.layout(),
                &b,
                rhs.layout(),
                &out_shape,
            )?
        };
        Ok(Self::contiguous_storage(storage, out_shape, self.device()))
    }

    /// 2-D convolution: [N, C, H, W] * [O, C, kH, kW] → [N, O, oH, oW].
    pub fn conv2d(&self, weight: &Self, params: Conv2dParams) -> Result<Self> {
        let out_shape = conv2d_output_shape(self.shape(), weight.shape(), &params)?;
        let storage = {
            let x = self.storage()?;
            let w = weight.storage()?;
            B::conv2d(
                self.device(),
                &x,
                self.layout(),
                &w,
                weight.layout(),
                &params,
            )?
        };
        Ok(Self::contiguous_storage(storage, out_shape, self.device()))
    }

    pub(crate) fn conv2d_backward_input(
        &self,
        weight: &Self,
        input_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<Self> {
        let storage = {
            let g = self.storage()?;
            let w = weight.storage()?;
            B::conv2d_backward_input(
                self.device(),
                &g,
                self.layout(),
                &w,
                weight.layout(),
                input_shape,
                params,
            )?
        };
        Ok(Self::contiguous_storage(
            storage,
            input_shape.clone(),
            self.device(),
        ))
    }

    pub(crate) fn conv2d_backward_weight(
        &self,
        input: &Self,
        weight_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<Self> {
        let storage = {
            let g = self.storage()?;
            let x = input.storage()?;
            B::conv2d_backward_weight(
                self.device(),
                &g,
                self.layout(),
                &x,
                input.layout(),
                weight_shape,
                params,
            )?
        };
        Ok(Self::contiguous_storage(
            storage,
            weight_shape.clone(),
            self.device(),
        ))
    }

    /// 2-D max pooling over [N, C, H, W].
    pub fn max_pool2d(&self, params: Pool2dParams) -> Result<Self> {
        let out_shape = pool2d_output_shape(self.shape(), &params)?;
        let storage = {
            let x = self.storage()?;
            B::max_pool2d(self.device(), &x, self.layout(), &params)?
        };
        Ok(Self::contiguous_storage(storage, out_shape, self.device()))
    }

    pub(crate) fn max_pool2d_backward(&self, grad: &Self, params: &Pool2dParams) -> Result<Self> {
        let storage = {
            let x = self.storage()?;
            let g = grad.storage()?;
            B::max_pool2d_backward(
                self.device(),
                &x,
                self.layout(),
                &g,
                grad.layout(),
                params,
            )?
        };
        Ok(Self::contiguous_storage(
            storage,
            self.shape().clone(),
            self.device(),
        ))
    }

    // Attention

    /// Fused attention with `self` as the query. `None` when the backend has
    /// no fused path for these operands.
    pub fn flash_attention(&self, key: &Self, value: &Self, causal: bool) -> Result<Option<Self>> {
        let params = self.attention_params(causal)?;
        Ok(self.fused_attention(key, value, &params)?.map(|(out, _)| out))
    }

    /// softmax(q·kᵀ·scale + mask)·v computed from primitive ops.
    pub fn scaled_dot_product_attention(&self, key: &Self, value: &Self, causal: bool) -> Result<Self> {
        let params = self.attention_params(causal)?;
        self.scaled_dot_product_attention_with(key, value, &params)
    }

    /// Fused attention when available, the explicit computation otherwise.
    pub fn attention(&self, key: &Self, value: &Self, causal: bool) -> Result<Self> {
        match self.flash_attention(key, value, causal)? {
            Some(out) => Ok(out),
            None => self.scaled_dot_product_attention(key, value, causal),
        }
    }

    pub(crate) fn attention_params(&self, causal: bool) -> Result<AttentionParams> {
        let head_dim = *self.dims().last().ok_or(Error::RankMismatch {
            expected: 2,
            got: 0,
        })?;
        Ok(AttentionParams::new(head_dim, causal))
    }

    pub(crate) fn scaled_dot_product_attention_with(
        &self,
        key: &Self,
        value: &Self,
        params: &AttentionParams,
    ) -> Result<Self> {
        check_attention_shapes(self, key, value)?;
        let mut scores = self.matmul(&key.t()?)?.mul_scalar(params.scale)?;
        if params.causal {
            scores = scores.binary(BinaryOp::Add, &self.causal_mask(key)?)?;
        }
        scores.softmax()?.matmul(value)
    }

    /// [seq_q, seq_k] additive mask: 0 where visible, −∞ elsewhere.
    pub(crate) fn causal_mask(&self, key: &Self) -> Result<Self> {
        let sq = self.dims()[self.rank() - 2];
        let sk = key.dims()[key.rank() - 2];
        let params = AttentionParams {
            causal: true,
            scale: 1.0,
        };
        let mut mask = Vec::with_capacity(sq * sk);
        for i in 0..sq {
            for j in 0..sk {
                mask.push(if params.visible(i, j, sq, sk) {
                    0.0
                } else {
                    f32::NEG_INFINITY
                });
            }
        }
        Self::from_vec(mask, (sq, sk), self.device())
    }

    /// (output, log-sum-exp) from the backend's fused kernel.
    pub(crate) fn fused_attention(
        &self,
        key: &Self,
        value: &Self,
        params: &AttentionParams,
    ) -> Result<Option<(Self, Self)>> {
        check_attention_shapes(self, key, value)?;
        if value.dims().last() != self.dims().last() {
            return Ok(None);
        }
        let fused = {
            let q = self.storage()?;
            let k = key.storage()?;
            let v = value.storage()?;
            B::flash_attention(
                self.device(),
                AttentionOperands {
                    q: (&q, self.layout()),
                    k: (&k, key.layout()),
                    v: (&v, value.layout()),
                },
                params,
            )?
        };
        let Some((out, lse)) = fused else {
            return Ok(None);
        };
        let lse_shape = Shape::from(&self.dims()[..self.rank() - 1]);
        Ok(Some((
            Self::contiguous_storage(out, self.shape().clone(), self.device()),
            Self::contiguous_storage(lse, lse_shape, self.device()),
        )))
    }

    pub(crate) fn fused_attention_backward(
        &self,
        key: &Self,
        value: &Self,
        output: &Self,
        lse: &Self,
        grad: &Self,
        params: &AttentionParams,
    ) -> Result<Option<(Self, Self, Self)>> {
        let grads = {
            let q = self.storage()?;
            let k = key.storage()?;
            let v = value.storage()?;
            let o = output.storage()?;
            let l = lse.storage()?;
            let g = grad.storage()?;
            B::flash_attention_backward(
                self.device(),
                AttentionBackwardOperands {
                    inputs: AttentionOperands {
                        q: (&q, self.layout()),
                        k: (&k, key.layout()),
                        v: (&v, value.layout()),
                    },
                    output: (&o, output.layout()),
                    lse: (&l, lse.layout()),
                    grad: (&g, grad.layout()),
                },
                params,
            )?
        };
        Ok(grads.map(|g| {
            (
                Self::contiguous_storage(g.dq, self.shape().clone(), self.device()),
                Self::contiguous_storage(g.dk, key.shape().clone(), self.device()),
                Self::contiguous_storage(g.dv, value.shape().clone(), self.device()),
            )
        }))
    }

    // Autograd state

    pub(crate) fn autograd_context(&self) -> Option<Arc<AutogradContext<B>>> {
        self.inner
            .autograd
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_autograd_context(&self, ctx: Option<Arc<AutogradContext<B>>>) {
        *self
            .inner
            .autograd
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ctx;
    }

    /// Start tracking gradients for this tensor.
    pub fn with_grad(self) -> Self {
        if self.autograd_context().is_none() {
            self.set_autograd_context(Some(Arc::new(AutogradContext::leaf())));
        }
        self
    }

    /// Stop tracking gradients; drops any accumulated gradient and graph.
    pub fn no_grad(self) -> Self {
        self.set_autograd_context(None);
        self
    }

    pub fn requires_grad(&self) -> bool {
        self.autograd_context()
            .map(|ctx| ctx.requires_grad())
            .unwrap_or(false)
    }

    /// Alias of [`Tensor::requires_grad`].
    pub fn uses_grad(&self) -> bool {
        self.requires_grad()
    }

    /// Whether this tensor has no recorded producing operation.
    pub fn is_leaf(&self) -> Result<bool> {
        Ok(self.operation()?.is_none())
    }

    /// The operation that produced this tensor, if recorded.
    pub fn operation(&self) -> Result<Option<Operation>> {
        match self.autograd_context() {
            Some(ctx) => ctx.operation(),
            None => Ok(None),
        }
    }

    /// Gradient accumulated by backward passes, if any.
    pub fn grad(&self) -> Result<Option<Self>> {
        match self.autograd_context() {
            Some(ctx) => ctx.grad(),
            None => Ok(None),
        }
    }

    pub fn zero_grad(&self) -> Result<()> {
        match self.autograd_context() {
            Some(ctx) => ctx.clear_grad(),
            None => Ok(()),
        }
    }

    /// Backpropagate from this tensor with a gradient of ones.
    pub fn backward(&self) -> Result<()> {
        self.backward_with_options(None, BackwardOptions::default())
    }

    /// Backpropagate `seed` (same shape as this tensor).
    pub fn backward_with(&self, seed: &Self) -> Result<()> {
        self.backward_with_options(Some(seed), BackwardOptions::default())
    }

    pub fn backward_with_options(&self, seed: Option<&Self>, options: BackwardOptions) -> Result<()> {
        let seed = match seed {
            Some(s) => s.detach(),
            None => self.ones_like()?,
        };
        autograd::run_backward(self, seed, options)
    }
}

pub(crate) fn conv2d_output_shape(
    input: &Shape,
    weight: &Shape,
    params: &Conv2dParams,
) -> Result<Shape> {
    if input.rank() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: input.rank(),
        });
    }
    if weight.rank() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: weight.rank(),
        });
    }
    let (n, c, h, w) = (input.dims()[0], input.dims()[1], input.dims()[2], input.dims()[3]);
    let (o, wc, kh, kw) = (
        weight.dims()[0],
        weight.dims()[1],
        weight.dims()[2],
        weight.dims()[3],
    );
    if c != wc {
        bail!("conv2d: input has {c} channels but weight {weight} expects {wc}");
    }
    let Some((oh, ow)) = params.output_hw(h, w, kh, kw) else {
        bail!("conv2d: kernel {kh}x{kw} does not fit input {h}x{w} with {params:?}");
    };
    Ok(Shape::from((n, o, oh, ow)))
}

pub(crate) fn pool2d_output_shape(input: &Shape, params: &Pool2dParams) -> Result<Shape> {
    if input.rank() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: input.rank(),
        });
    }
    let d = input.dims();
    let Some((oh, ow)) = params.output_hw(d[2], d[3]) else {
        bail!("max_pool2d: window {params:?} does not fit input {input}");
    };
    Ok(Shape::from((d[0], d[1], oh, ow)))
}

fn check_attention_shapes<B: Backend>(q: &Tensor<B>, k: &Tensor<B>, v: &Tensor<B>) -> Result<()> {
    let rank = q.rank();
    if rank < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: rank,
        });
    }
    for t in [k, v] {
        if t.rank() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: t.rank(),
            });
        }
        if t.dims()[..rank - 2] != q.dims()[..rank - 2] {
            return Err(Error::ShapeMismatch {
                expected: q.shape().clone(),
                got: t.shape().clone(),
            });
        }
    }
    if k.dims()[rank - 1] != q.dims()[rank - 1] || v.dims()[rank - 2] != k.dims()[rank - 2] {
        bail!(
            "attention: incompatible query {}, key {}, value {}",
            q.shape(),
            k.shape(),
            v.shape()
        );
    }
    Ok(())
}
