// Host Backend — runs every tensor operation on the CPU
//
// CpuStorage is a plain Vec<f32>. Views (transpose, permute, reshape) alias
// it, so kernels read operands through their layouts and only materialize a
// contiguous copy where an algorithm needs one.
//
// Execution follows two strategies (see `parallel`): fork-join bisection for
// element-wise maps and pre-partitioned row blocks for row-structured work.
// Both fall back to the calling thread below `HostConfig::parallel_threshold`.
//
// USAGE:
//   let dev = CpuDevice::default();
//   let a = CpuTensor::randn((2, 3), &dev)?;

pub mod broadcast;
pub mod config;
pub mod conv;
pub mod layout_ops;
pub mod matmul;
pub mod norm;
pub mod parallel;
pub mod simd;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use vela_core::backend::Operand;
use vela_core::{
    Activation, Backend, BackendDevice, BackendStorage, BinaryOp, Conv2dParams, Error, Layout,
    Pool2dParams, ResolvedRange, Result, Shape, Tensor,
};

pub use config::HostConfig;
use layout_ops::contiguous;
use parallel::fork_join;

/// The host device. Carries the execution configuration.
#[derive(Debug, Clone, Default)]
pub struct CpuDevice {
    config: HostConfig,
}

impl CpuDevice {
    pub fn with_config(config: HostConfig) -> Self {
        CpuDevice { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host storage: a row-major buffer of f32.
#[derive(Debug)]
pub struct CpuStorage(pub Vec<f32>);

impl CpuStorage {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl BackendStorage for CpuStorage {
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience alias.
pub type CpuTensor = Tensor<CpuBackend>;

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_rng(rand::thread_rng()).unwrap_or_else(|_| StdRng::seed_from_u64(0)),
    }
}

fn element_count_check(data: &[f32], shape: &Shape) -> Result<()> {
    if data.len() != shape.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape: shape.clone(),
            expected: shape.elem_count(),
            got: data.len(),
        });
    }
    Ok(())
}

fn map_unary(
    cfg: &HostConfig,
    input: &[f32],
    layout: &Layout,
    f: impl Fn(f32) -> f32 + Sync,
) -> Vec<f32> {
    let x = contiguous(cfg, input, layout);
    let mut out = vec![0.0f32; x.len()];
    fork_join(cfg, &mut out, &|offset, piece| {
        simd::map(&x[offset..offset + piece.len()], piece, &f);
    });
    out
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    const ALIASING_VIEWS: bool = true;

    //  Creation

    fn zeros(_device: &CpuDevice, shape: &Shape) -> Result<CpuStorage> {
        Ok(CpuStorage(vec![0.0; shape.elem_count()]))
    }

    fn full(_device: &CpuDevice, shape: &Shape, value: f32) -> Result<CpuStorage> {
        Ok(CpuStorage(vec![value; shape.elem_count()]))
    }

    fn from_vec(_device: &CpuDevice, data: Vec<f32>, shape: &Shape) -> Result<CpuStorage> {
        element_count_check(&data, shape)?;
        Ok(CpuStorage(data))
    }

    fn rand_uniform(_device: &CpuDevice, shape: &Shape, seed: Option<u64>) -> Result<CpuStorage> {
        let mut rng = rng(seed);
        Ok(CpuStorage(
            (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect(),
        ))
    }

    fn rand_normal(_device: &CpuDevice, shape: &Shape, seed: Option<u64>) -> Result<CpuStorage> {
        let normal = Normal::new(0.0f32, 1.0).map_err(|e| Error::msg(e.to_string()))?;
        let mut rng = rng(seed);
        Ok(CpuStorage(
            (0..shape.elem_count()).map(|_| normal.sample(&mut rng)).collect(),
        ))
    }

    //  Data movement

    fn to_vec(device: &CpuDevice, input: &CpuStorage, layout: &Layout) -> Result<Vec<f32>> {
        Ok(layout_ops::materialize(&device.config, &input.0, layout))
    }

    fn read_element(_device: &CpuDevice, input: &CpuStorage, position: usize) -> Result<f32> {
        input.0.get(position).copied().ok_or(Error::IndexOutOfBounds {
            dim: 0,
            index: position,
            size: input.0.len(),
        })
    }

    fn write_element(
        _device: &CpuDevice,
        input: &mut CpuStorage,
        position: usize,
        value: f32,
    ) -> Result<()> {
        let size = input.0.len();
        let slot = input.0.get_mut(position).ok_or(Error::IndexOutOfBounds {
            dim: 0,
            index: position,
            size,
        })?;
        *slot = value;
        Ok(())
    }

    fn materialize(
        device: &CpuDevice,
        input: &CpuStorage,
        layout: &Layout,
        shape: &Shape,
    ) -> Result<CpuStorage> {
        if shape.elem_count() != layout.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: layout.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape.clone(),
            });
        }
        Ok(CpuStorage(layout_ops::materialize(
            &device.config,
            &input.0,
            layout,
        )))
    }

    //  Element-wise

    fn binary_op(
        device: &CpuDevice,
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        broadcast::binary(&device.config, op, &lhs.0, lhs_layout, &rhs.0, rhs_layout)
            .map(CpuStorage)
    }

    fn binary_op_inplace(
        device: &CpuDevice,
        op: BinaryOp,
        lhs: &mut CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<()> {
        broadcast::binary_inplace(&device.config, op, &mut lhs.0, lhs_layout, &rhs.0, rhs_layout)
    }

    fn scalar_op(
        device: &CpuDevice,
        op: BinaryOp,
        input: &CpuStorage,
        layout: &Layout,
        scalar: f32,
    ) -> Result<CpuStorage> {
        Ok(CpuStorage(map_unary(&device.config, &input.0, layout, |x| {
            op.apply(x, scalar)
        })))
    }

    fn activation(
        device: &CpuDevice,
        act: Activation,
        input: &CpuStorage,
        layout: &Layout,
    ) -> Result<CpuStorage> {
        Ok(CpuStorage(map_unary(&device.config, &input.0, layout, |x| {
            act.apply(x)
        })))
    }

    fn activation_backward(
        device: &CpuDevice,
        act: Activation,
        input: &CpuStorage,
        input_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
    ) -> Result<CpuStorage> {
        let cfg = &device.config;
        if input_layout.shape() != grad_layout.shape() {
            return Err(Error::ShapeMismatch {
                expected: input_layout.shape().clone(),
                got: grad_layout.shape().clone(),
            });
        }
        let x = contiguous(cfg, &input.0, input_layout);
        let g = contiguous(cfg, &grad.0, grad_layout);
        let mut out = vec![0.0f32; x.len()];
        fork_join(cfg, &mut out, &|offset, piece| {
            let end = offset + piece.len();
            simd::zip_map(&x[offset..end], &g[offset..end], piece, |xv, gv| {
                gv * act.derivative(xv)
            });
        });
        Ok(CpuStorage(out))
    }

    //  Reductions

    fn sum_to_shape(
        device: &CpuDevice,
        input: &CpuStorage,
        layout: &Layout,
        target: &Shape,
    ) -> Result<CpuStorage> {
        broadcast::sum_to_shape(&device.config, &input.0, layout, target).map(CpuStorage)
    }

    fn softmax(device: &CpuDevice, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        norm::softmax(&device.config, &input.0, layout).map(CpuStorage)
    }

    fn softmax_backward(
        device: &CpuDevice,
        output: &CpuStorage,
        output_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
    ) -> Result<CpuStorage> {
        norm::softmax_backward(&device.config, &output.0, output_layout, &grad.0, grad_layout)
            .map(CpuStorage)
    }

    fn layer_norm(
        device: &CpuDevice,
        input: &CpuStorage,
        layout: &Layout,
        eps: f32,
    ) -> Result<CpuStorage> {
        norm::layer_norm(&device.config, &input.0, layout, eps).map(CpuStorage)
    }

    fn layer_norm_backward(
        device: &CpuDevice,
        input: &CpuStorage,
        input_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
        eps: f32,
    ) -> Result<CpuStorage> {
        norm::layer_norm_backward(
            &device.config,
            &input.0,
            input_layout,
            &grad.0,
            grad_layout,
            eps,
        )
        .map(CpuStorage)
    }

    //  Linear algebra

    fn matmul(
        device: &CpuDevice,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<CpuStorage> {
        matmul::matmul(&device.config, &lhs.0, lhs_layout, &rhs.0, rhs_layout, out_shape)
            .map(CpuStorage)
    }

    fn conv2d(
        device: &CpuDevice,
        input: &CpuStorage,
        input_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        params: &Conv2dParams,
    ) -> Result<CpuStorage> {
        conv::conv2d(
            &device.config,
            &input.0,
            input_layout,
            &weight.0,
            weight_layout,
            params,
        )
        .map(CpuStorage)
    }

    fn conv2d_backward_input(
        device: &CpuDevice,
        grad: &CpuStorage,
        grad_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        input_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<CpuStorage> {
        conv::conv2d_backward_input(
            &device.config,
            &grad.0,
            grad_layout,
            &weight.0,
            weight_layout,
            input_shape,
            params,
        )
        .map(CpuStorage)
    }

    fn conv2d_backward_weight(
        device: &CpuDevice,
        grad: &CpuStorage,
        grad_layout: &Layout,
        input: &CpuStorage,
        input_layout: &Layout,
        weight_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<CpuStorage> {
        conv::conv2d_backward_weight(
            &device.config,
            &grad.0,
            grad_layout,
            &input.0,
            input_layout,
            weight_shape,
            params,
        )
        .map(CpuStorage)
    }

    fn max_pool2d(
        device: &CpuDevice,
        input: &CpuStorage,
        layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<CpuStorage> {
        conv::max_pool2d(&device.config, &input.0, layout, params).map(CpuStorage)
    }

    fn max_pool2d_backward(
        device: &CpuDevice,
        input: &CpuStorage,
        input_layout: &Layout,
        grad: &CpuStorage,
        grad_layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<CpuStorage> {
        conv::max_pool2d_backward(
            &device.config,
            &input.0,
            input_layout,
            &grad.0,
            grad_layout,
            params,
        )
        .map(CpuStorage)
    }

    //  Structural

    fn slice(
        _device: &CpuDevice,
        input: &CpuStorage,
        layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<CpuStorage> {
        Ok(CpuStorage(layout_ops::slice(&input.0, layout, ranges)))
    }

    fn slice_accumulate(
        device: &CpuDevice,
        dst: &mut CpuStorage,
        dst_shape: &Shape,
        src: &CpuStorage,
        src_layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<()> {
        layout_ops::slice_accumulate(&device.config, &mut dst.0, dst_shape, &src.0, src_layout, ranges)
    }

    fn concat(
        device: &CpuDevice,
        inputs: &[Operand<'_, CpuStorage>],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<CpuStorage> {
        let parts: Vec<(&[f32], &Layout)> = inputs
            .iter()
            .map(|(s, l)| (s.as_slice(), *l))
            .collect();
        Ok(CpuStorage(layout_ops::concat(
            &device.config,
            &parts,
            out_shape,
            dim,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_draws_repeat() {
        let dev = CpuDevice::default();
        let shape = Shape::from((4, 4));
        let a = CpuBackend::rand_normal(&dev, &shape, Some(7)).unwrap();
        let b = CpuBackend::rand_normal(&dev, &shape, Some(7)).unwrap();
        assert_eq!(a.0, b.0);
        let u = CpuBackend::rand_uniform(&dev, &shape, None).unwrap();
        assert!(u.0.iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn element_access_is_bounds_checked() {
        let dev = CpuDevice::default();
        let mut s = CpuBackend::zeros(&dev, &Shape::from(3)).unwrap();
        CpuBackend::write_element(&dev, &mut s, 2, 5.0).unwrap();
        assert_eq!(CpuBackend::read_element(&dev, &s, 2).unwrap(), 5.0);
        assert!(CpuBackend::read_element(&dev, &s, 3).is_err());
    }

    #[test]
    fn from_vec_checks_count() {
        let dev = CpuDevice::default();
        let err = CpuBackend::from_vec(&dev, vec![1.0; 5], &Shape::from((2, 3))).unwrap_err();
        assert!(matches!(err, Error::ElementCountMismatch { expected: 6, got: 5, .. }));
    }
}
