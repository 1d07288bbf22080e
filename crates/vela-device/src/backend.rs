// Device Backend — the Backend trait over device storage and named kernels
//
// Every operation follows the same steps: make the operands contiguous
// (a strided-copy kernel when a layout doesn't match its storage), allocate
// the output storage, upload any descriptors the kernel needs as temporary
// index buffers, and enqueue the kernel. Nothing waits on the queue except
// reads back to the host.
//
// Random numbers are drawn on the host and uploaded.

use std::ops::Deref;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use vela_core::backend::{
    AttentionBackwardOperands, AttentionGrads, AttentionOperands, Operand,
};
use vela_core::layout::unravel_index;
use vela_core::slice::sliced_shape;
use vela_core::{
    bail, Activation, AttentionParams, Backend, BinaryOp, Conv2dParams, DeviceError, Error,
    Layout, Pool2dParams, ResolvedRange, Result, Shape,
};

use crate::device::Device;
use crate::storage::DeviceStorage;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBackend;

/// An operand in contiguous form: borrowed when its layout already matches
/// its storage, otherwise a fresh copy.
enum Contiguous<'a> {
    Borrowed(&'a DeviceStorage),
    Owned(DeviceStorage),
}

impl Deref for Contiguous<'_> {
    type Target = DeviceStorage;

    fn deref(&self) -> &DeviceStorage {
        match self {
            Contiguous::Borrowed(s) => s,
            Contiguous::Owned(s) => s,
        }
    }
}

fn check_device(device: &Device, storage: &DeviceStorage) -> Result<()> {
    if !storage.device().same_device(device) {
        return Err(DeviceError::DeviceMismatch.into());
    }
    Ok(())
}

/// Gather `layout`'s elements of `input` into new storage of `shape`.
fn copy_strided(
    device: &Device,
    input: &DeviceStorage,
    layout: &Layout,
    shape: &Shape,
) -> Result<DeviceStorage> {
    check_device(device, input)?;
    let n = layout.elem_count();
    let out = DeviceStorage::zeros(device, shape)?;
    let dims = device.index_buffer(layout.dims())?;
    let strides = device.index_buffer(layout.strides())?;
    device
        .kernel("copy_strided")?
        .arg_buffer(input.data())
        .arg_buffer(out.data())
        .arg_index(&dims)
        .arg_index(&strides)
        .arg_usize(layout.rank())
        .arg_usize(n)
        .global(&[n])
        .launch()?;
    Ok(out)
}

fn ensure_contiguous<'a>(
    device: &Device,
    storage: &'a DeviceStorage,
    layout: &Layout,
) -> Result<Contiguous<'a>> {
    check_device(device, storage)?;
    if layout.is_contiguous() && layout.shape() == storage.shape() {
        return Ok(Contiguous::Borrowed(storage));
    }
    copy_strided(device, storage, layout, layout.shape()).map(Contiguous::Owned)
}

/// (batch, inner) when `small`, right-aligned, is [outer.., 1.., inner..]
/// against `full`.
fn broadcast_pattern(full: &Shape, small: &Shape) -> Option<(usize, usize)> {
    if small.rank() > full.rank() {
        return None;
    }
    let small = small.padded_to(full.rank());
    let (f, s) = (full.dims(), small.dims());
    let mut i = 0;
    while i < f.len() && s[i] == f[i] {
        i += 1;
    }
    let middle = i;
    while i < f.len() && s[i] == 1 {
        i += 1;
    }
    if s[i..] != f[i..] {
        return None;
    }
    Some((f[middle..i].iter().product(), f[i..].iter().product()))
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_rng(rand::thread_rng()).unwrap_or_else(|_| StdRng::seed_from_u64(0)),
    }
}

fn row_shape(layout: &Layout) -> (usize, usize) {
    let cols = layout.dims().last().copied().unwrap_or(1);
    let rows = if cols == 0 { 0 } else { layout.elem_count() / cols };
    (rows, cols)
}

/// Element offsets of each output batch's [rows, cols] block in an operand
/// whose batch dims broadcast into `out_batch`.
fn batch_offsets(batch_dims: &[usize], out_batch: &Shape, block: usize) -> Result<Vec<usize>> {
    let batch_shape = Shape::from(batch_dims);
    let strides: Vec<usize> = batch_shape
        .stride_contiguous()
        .iter()
        .map(|s| s * block)
        .collect();
    let strides = batch_shape.broadcast_strides(&strides, out_batch)?;
    let mut coords = vec![0; out_batch.rank()];
    Ok((0..out_batch.elem_count())
        .map(|b| {
            unravel_index(b, out_batch.dims(), &mut coords);
            coords.iter().zip(&strides).map(|(c, s)| c * s).sum()
        })
        .collect())
}

fn conv_geometry(input: &Shape, weight: &Shape, params: &Conv2dParams) -> Result<([usize; 13], Shape)> {
    let (i, k) = (input.dims(), weight.dims());
    if i.len() != 4 || k.len() != 4 || i[1] != k[1] {
        bail!("conv2d: incompatible input {input} and weight {weight}");
    }
    let Some((oh, ow)) = params.output_hw(i[2], i[3], k[2], k[3]) else {
        bail!("conv2d: kernel {weight} does not fit input {input}");
    };
    let geometry = [
        i[0],
        i[1],
        i[2],
        i[3],
        k[0],
        k[2],
        k[3],
        oh,
        ow,
        params.stride[0],
        params.stride[1],
        params.padding[0],
        params.padding[1],
    ];
    Ok((geometry, Shape::from((i[0], k[0], oh, ow))))
}

fn pool_geometry(input: &Shape, params: &Pool2dParams) -> Result<([usize; 10], Shape)> {
    let i = input.dims();
    if i.len() != 4 {
        bail!("max_pool2d: expected an NCHW input, got {input}");
    }
    let Some((oh, ow)) = params.output_hw(i[2], i[3]) else {
        bail!("max_pool2d: window {params:?} does not fit input {input}");
    };
    let geometry = [
        i[0],
        i[1],
        i[2],
        i[3],
        params.kernel[0],
        params.kernel[1],
        oh,
        ow,
        params.stride[0],
        params.stride[1],
    ];
    Ok((geometry, Shape::from((i[0], i[1], oh, ow))))
}

fn expect_shape(expected: &Shape, got: &Shape) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            expected: expected.clone(),
            got: got.clone(),
        });
    }
    Ok(())
}

/// batch, seq, head_dim of a [batch..., seq, head_dim] attention operand.
fn attention_dims(layout: &Layout) -> Option<(usize, usize, usize)> {
    let d = layout.dims();
    let rank = d.len();
    if rank < 2 {
        return None;
    }
    Some((d[..rank - 2].iter().product(), d[rank - 2], d[rank - 1]))
}

impl Backend for DeviceBackend {
    type Device = Device;
    type Storage = DeviceStorage;

    const ALIASING_VIEWS: bool = false;

    //  Creation

    fn zeros(device: &Device, shape: &Shape) -> Result<DeviceStorage> {
        DeviceStorage::zeros(device, shape)
    }

    fn full(device: &Device, shape: &Shape, value: f32) -> Result<DeviceStorage> {
        let out = DeviceStorage::zeros(device, shape)?;
        let n = shape.elem_count();
        device
            .kernel("fill")?
            .arg_buffer(out.data())
            .arg_float(value)
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(out)
    }

    fn from_vec(device: &Device, data: Vec<f32>, shape: &Shape) -> Result<DeviceStorage> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        DeviceStorage::from_slice(device, &data, shape)
    }

    fn rand_uniform(device: &Device, shape: &Shape, seed: Option<u64>) -> Result<DeviceStorage> {
        let mut rng = rng(seed);
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect();
        DeviceStorage::from_slice(device, &data, shape)
    }

    fn rand_normal(device: &Device, shape: &Shape, seed: Option<u64>) -> Result<DeviceStorage> {
        let normal = Normal::new(0.0f32, 1.0).map_err(|e| Error::msg(e.to_string()))?;
        let mut rng = rng(seed);
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| normal.sample(&mut rng))
            .collect();
        DeviceStorage::from_slice(device, &data, shape)
    }

    //  Data movement

    fn to_vec(device: &Device, input: &DeviceStorage, layout: &Layout) -> Result<Vec<f32>> {
        ensure_contiguous(device, input, layout)?.to_host()
    }

    fn read_element(device: &Device, input: &DeviceStorage, position: usize) -> Result<f32> {
        check_device(device, input)?;
        input.data().read_at(position)
    }

    fn write_element(
        device: &Device,
        input: &mut DeviceStorage,
        position: usize,
        value: f32,
    ) -> Result<()> {
        check_device(device, input)?;
        input.data().write_at(position, &[value])
    }

    fn materialize(
        device: &Device,
        input: &DeviceStorage,
        layout: &Layout,
        shape: &Shape,
    ) -> Result<DeviceStorage> {
        if shape.elem_count() != layout.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: layout.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape.clone(),
            });
        }
        copy_strided(device, input, layout, shape)
    }

    //  Element-wise

    fn binary_op(
        device: &Device,
        op: BinaryOp,
        lhs: &DeviceStorage,
        lhs_layout: &Layout,
        rhs: &DeviceStorage,
        rhs_layout: &Layout,
    ) -> Result<DeviceStorage> {
        let out_shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())?;
        let a = ensure_contiguous(device, lhs, lhs_layout)?;
        let b = ensure_contiguous(device, rhs, rhs_layout)?;
        let out = DeviceStorage::zeros(device, &out_shape)?;
        let n = out_shape.elem_count();

        if a.shape() == b.shape() {
            device
                .kernel("binary_same")?
                .arg_buffer(a.data())
                .arg_buffer(b.data())
                .arg_buffer(out.data())
                .arg_int(op.code())
                .arg_usize(n)
                .global(&[n])
                .launch()?;
            return Ok(out);
        }

        let pattern = if a.shape() == &out_shape {
            broadcast_pattern(&out_shape, b.shape()).map(|p| (1, p))
        } else if b.shape() == &out_shape {
            broadcast_pattern(&out_shape, a.shape()).map(|p| (0, p))
        } else {
            None
        };
        match pattern {
            Some((small_side, (batch, inner))) => device
                .kernel("binary_bcast")?
                .arg_buffer(a.data())
                .arg_buffer(b.data())
                .arg_buffer(out.data())
                .arg_int(op.code())
                .arg_usize(n)
                .arg_usize(inner)
                .arg_usize(batch)
                .arg_int(small_side)
                .global(&[n])
                .launch()?,
            None => device
                .kernel("binary_generic")?
                .arg_buffer(a.data())
                .arg_index(a.dims())
                .arg_index(a.strides())
                .arg_buffer(b.data())
                .arg_index(b.dims())
                .arg_index(b.strides())
                .arg_buffer(out.data())
                .arg_index(out.dims())
                .arg_usize(a.shape().rank())
                .arg_usize(b.shape().rank())
                .arg_usize(out_shape.rank())
                .arg_int(op.code())
                .arg_usize(n)
                .global(&[n])
                .launch()?,
        }
        Ok(out)
    }

    fn binary_op_inplace(
        device: &Device,
        op: BinaryOp,
        lhs: &mut DeviceStorage,
        lhs_layout: &Layout,
        rhs: &DeviceStorage,
        rhs_layout: &Layout,
    ) -> Result<()> {
        check_device(device, lhs)?;
        let shape = lhs_layout.shape();
        if !rhs_layout.shape().broadcasts_into(shape) {
            return Err(Error::NotBroadcastable {
                lhs: shape.clone(),
                rhs: rhs_layout.shape().clone(),
            });
        }
        if !lhs_layout.is_contiguous() || lhs_layout.elem_count() != lhs.data().len() {
            bail!("in-place device arithmetic needs a contiguous destination, got {shape}");
        }
        let b = ensure_contiguous(device, rhs, rhs_layout)?;
        let n = shape.elem_count();

        if b.shape() == shape {
            device
                .kernel("binary_same_inplace")?
                .arg_buffer(lhs.data())
                .arg_buffer(b.data())
                .arg_int(op.code())
                .arg_usize(n)
                .global(&[n])
                .launch()?;
        } else if let Some((batch, inner)) = broadcast_pattern(shape, b.shape()) {
            device
                .kernel("binary_bcast_inplace")?
                .arg_buffer(lhs.data())
                .arg_buffer(b.data())
                .arg_int(op.code())
                .arg_usize(n)
                .arg_usize(inner)
                .arg_usize(batch)
                .global(&[n])
                .launch()?;
        } else {
            let dims = device.index_buffer(shape.dims())?;
            device
                .kernel("binary_generic_inplace")?
                .arg_buffer(lhs.data())
                .arg_index(&dims)
                .arg_buffer(b.data())
                .arg_index(b.dims())
                .arg_index(b.strides())
                .arg_usize(shape.rank())
                .arg_usize(b.shape().rank())
                .arg_int(op.code())
                .arg_usize(n)
                .global(&[n])
                .launch()?;
        }
        Ok(())
    }

    fn scalar_op(
        device: &Device,
        op: BinaryOp,
        input: &DeviceStorage,
        layout: &Layout,
        scalar: f32,
    ) -> Result<DeviceStorage> {
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, layout.shape())?;
        let n = layout.elem_count();
        device
            .kernel("scalar")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_int(op.code())
            .arg_float(scalar)
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(out)
    }

    fn activation(
        device: &Device,
        act: Activation,
        input: &DeviceStorage,
        layout: &Layout,
    ) -> Result<DeviceStorage> {
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, layout.shape())?;
        let n = layout.elem_count();
        let (code, param) = act.encode();
        device
            .kernel("activation")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_int(code)
            .arg_float(param)
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(out)
    }

    fn activation_backward(
        device: &Device,
        act: Activation,
        input: &DeviceStorage,
        input_layout: &Layout,
        grad: &DeviceStorage,
        grad_layout: &Layout,
    ) -> Result<DeviceStorage> {
        expect_shape(input_layout.shape(), grad_layout.shape())?;
        let x = ensure_contiguous(device, input, input_layout)?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let out = DeviceStorage::zeros(device, input_layout.shape())?;
        let n = input_layout.elem_count();
        let (code, param) = act.encode();
        device
            .kernel("activation_backward")?
            .arg_buffer(x.data())
            .arg_buffer(g.data())
            .arg_buffer(out.data())
            .arg_int(code)
            .arg_float(param)
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(out)
    }

    //  Reductions

    fn sum_to_shape(
        device: &Device,
        input: &DeviceStorage,
        layout: &Layout,
        target: &Shape,
    ) -> Result<DeviceStorage> {
        if !target.broadcasts_into(layout.shape()) {
            return Err(Error::NotBroadcastable {
                lhs: layout.shape().clone(),
                rhs: target.clone(),
            });
        }
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, target)?;
        let n_out = target.elem_count();
        if n_out == 0 {
            return Ok(out);
        }
        device
            .kernel("sum_axes")?
            .arg_buffer(x.data())
            .arg_index(x.dims())
            .arg_index(x.strides())
            .arg_buffer(out.data())
            .arg_index(out.dims())
            .arg_usize(layout.rank())
            .arg_usize(target.rank())
            .arg_usize(n_out)
            .arg_usize(layout.elem_count() / n_out)
            .global(&[n_out])
            .launch()?;
        Ok(out)
    }

    fn softmax(device: &Device, input: &DeviceStorage, layout: &Layout) -> Result<DeviceStorage> {
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, layout.shape())?;
        let (rows, cols) = row_shape(layout);
        device
            .kernel("softmax")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_usize(rows)
            .arg_usize(cols)
            .global(&[rows])
            .launch()?;
        Ok(out)
    }

    fn softmax_backward(
        device: &Device,
        output: &DeviceStorage,
        output_layout: &Layout,
        grad: &DeviceStorage,
        grad_layout: &Layout,
    ) -> Result<DeviceStorage> {
        expect_shape(output_layout.shape(), grad_layout.shape())?;
        let y = ensure_contiguous(device, output, output_layout)?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let out = DeviceStorage::zeros(device, output_layout.shape())?;
        let (rows, cols) = row_shape(output_layout);
        device
            .kernel("softmax_backward")?
            .arg_buffer(y.data())
            .arg_buffer(g.data())
            .arg_buffer(out.data())
            .arg_usize(rows)
            .arg_usize(cols)
            .global(&[rows])
            .launch()?;
        Ok(out)
    }

    fn layer_norm(
        device: &Device,
        input: &DeviceStorage,
        layout: &Layout,
        eps: f32,
    ) -> Result<DeviceStorage> {
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, layout.shape())?;
        let (rows, cols) = row_shape(layout);
        device
            .kernel("layer_norm")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_usize(rows)
            .arg_usize(cols)
            .arg_float(eps)
            .global(&[rows])
            .launch()?;
        Ok(out)
    }

    fn layer_norm_backward(
        device: &Device,
        input: &DeviceStorage,
        input_layout: &Layout,
        grad: &DeviceStorage,
        grad_layout: &Layout,
        eps: f32,
    ) -> Result<DeviceStorage> {
        expect_shape(input_layout.shape(), grad_layout.shape())?;
        let x = ensure_contiguous(device, input, input_layout)?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let out = DeviceStorage::zeros(device, input_layout.shape())?;
        let (rows, cols) = row_shape(input_layout);
        device
            .kernel("layer_norm_backward")?
            .arg_buffer(x.data())
            .arg_buffer(g.data())
            .arg_buffer(out.data())
            .arg_usize(rows)
            .arg_usize(cols)
            .arg_float(eps)
            .global(&[rows])
            .launch()?;
        Ok(out)
    }

    //  Linear algebra

    fn matmul(
        device: &Device,
        lhs: &DeviceStorage,
        lhs_layout: &Layout,
        rhs: &DeviceStorage,
        rhs_layout: &Layout,
        out_shape: &Shape,
    ) -> Result<DeviceStorage> {
        let (lhs_batch, m, k) = lhs_layout.shape().matrix_dims()?;
        let (rhs_batch, k2, n) = rhs_layout.shape().matrix_dims()?;
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        let (out_batch, om, on) = out_shape.matrix_dims()?;
        if om != m || on != n {
            return Err(Error::ShapeMismatch {
                expected: out_shape.clone(),
                got: Shape::from((m, n)),
            });
        }
        let out_batch = Shape::from(out_batch);
        let batch = out_batch.elem_count();
        let a_offsets = device.index_buffer(&batch_offsets(lhs_batch, &out_batch, m * k)?)?;
        let b_offsets = device.index_buffer(&batch_offsets(rhs_batch, &out_batch, k * n)?)?;
        let c_offsets: Vec<usize> = (0..batch).map(|b| b * m * n).collect();
        let c_offsets = device.index_buffer(&c_offsets)?;

        let a = ensure_contiguous(device, lhs, lhs_layout)?;
        let b = ensure_contiguous(device, rhs, rhs_layout)?;
        let out = DeviceStorage::zeros(device, out_shape)?;
        device
            .kernel("matmul_batched")?
            .arg_buffer(a.data())
            .arg_buffer(b.data())
            .arg_buffer(out.data())
            .arg_index(&a_offsets)
            .arg_index(&b_offsets)
            .arg_index(&c_offsets)
            .arg_usize(m)
            .arg_usize(k)
            .arg_usize(n)
            .arg_usize(batch)
            .global(&[n, m, batch])
            .local(&[8, 8, 1])
            .launch()?;
        Ok(out)
    }

    fn conv2d(
        device: &Device,
        input: &DeviceStorage,
        input_layout: &Layout,
        weight: &DeviceStorage,
        weight_layout: &Layout,
        params: &Conv2dParams,
    ) -> Result<DeviceStorage> {
        let (geometry, out_shape) =
            conv_geometry(input_layout.shape(), weight_layout.shape(), params)?;
        let x = ensure_contiguous(device, input, input_layout)?;
        let w = ensure_contiguous(device, weight, weight_layout)?;
        let out = DeviceStorage::zeros(device, &out_shape)?;
        let geometry = device.index_buffer(&geometry)?;
        let total = out_shape.elem_count();
        device
            .kernel("conv2d")?
            .arg_buffer(x.data())
            .arg_buffer(w.data())
            .arg_buffer(out.data())
            .arg_index(&geometry)
            .arg_usize(total)
            .global(&[total])
            .launch()?;
        Ok(out)
    }

    fn conv2d_backward_input(
        device: &Device,
        grad: &DeviceStorage,
        grad_layout: &Layout,
        weight: &DeviceStorage,
        weight_layout: &Layout,
        input_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<DeviceStorage> {
        let (geometry, out_shape) = conv_geometry(input_shape, weight_layout.shape(), params)?;
        expect_shape(&out_shape, grad_layout.shape())?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let w = ensure_contiguous(device, weight, weight_layout)?;
        let out = DeviceStorage::zeros(device, input_shape)?;
        let geometry = device.index_buffer(&geometry)?;
        let total = input_shape.elem_count();
        device
            .kernel("conv2d_backward_input")?
            .arg_buffer(g.data())
            .arg_buffer(w.data())
            .arg_buffer(out.data())
            .arg_index(&geometry)
            .arg_usize(total)
            .global(&[total])
            .launch()?;
        Ok(out)
    }

    fn conv2d_backward_weight(
        device: &Device,
        grad: &DeviceStorage,
        grad_layout: &Layout,
        input: &DeviceStorage,
        input_layout: &Layout,
        weight_shape: &Shape,
        params: &Conv2dParams,
    ) -> Result<DeviceStorage> {
        let (geometry, out_shape) = conv_geometry(input_layout.shape(), weight_shape, params)?;
        expect_shape(&out_shape, grad_layout.shape())?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let x = ensure_contiguous(device, input, input_layout)?;
        let out = DeviceStorage::zeros(device, weight_shape)?;
        let geometry = device.index_buffer(&geometry)?;
        let total = weight_shape.elem_count();
        device
            .kernel("conv2d_backward_weight")?
            .arg_buffer(g.data())
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_index(&geometry)
            .arg_usize(total)
            .global(&[total])
            .launch()?;
        Ok(out)
    }

    fn max_pool2d(
        device: &Device,
        input: &DeviceStorage,
        layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<DeviceStorage> {
        let (geometry, out_shape) = pool_geometry(layout.shape(), params)?;
        let x = ensure_contiguous(device, input, layout)?;
        let out = DeviceStorage::zeros(device, &out_shape)?;
        let geometry = device.index_buffer(&geometry)?;
        let total = out_shape.elem_count();
        device
            .kernel("max_pool2d")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_index(&geometry)
            .arg_usize(total)
            .global(&[total])
            .launch()?;
        Ok(out)
    }

    fn max_pool2d_backward(
        device: &Device,
        input: &DeviceStorage,
        input_layout: &Layout,
        grad: &DeviceStorage,
        grad_layout: &Layout,
        params: &Pool2dParams,
    ) -> Result<DeviceStorage> {
        let (geometry, out_shape) = pool_geometry(input_layout.shape(), params)?;
        expect_shape(&out_shape, grad_layout.shape())?;
        let x = ensure_contiguous(device, input, input_layout)?;
        let g = ensure_contiguous(device, grad, grad_layout)?;
        let out = DeviceStorage::zeros(device, input_layout.shape())?;
        let geometry = device.index_buffer(&geometry)?;
        let total = input_layout.elem_count();
        device
            .kernel("max_pool2d_backward")?
            .arg_buffer(x.data())
            .arg_buffer(g.data())
            .arg_buffer(out.data())
            .arg_index(&geometry)
            .arg_usize(total)
            .global(&[total])
            .launch()?;
        Ok(out)
    }

    //  Structural

    fn slice(
        device: &Device,
        input: &DeviceStorage,
        layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<DeviceStorage> {
        if ranges.len() != layout.rank() {
            return Err(Error::TooManySliceRanges {
                ranges: ranges.len(),
                rank: layout.rank(),
            });
        }
        let x = ensure_contiguous(device, input, layout)?;
        let out_shape = sliced_shape(ranges);
        let out = DeviceStorage::zeros(device, &out_shape)?;
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        let steps: Vec<usize> = ranges.iter().map(|r| r.step).collect();
        let (starts, steps) = (device.index_buffer(&starts)?, device.index_buffer(&steps)?);
        let n = out_shape.elem_count();
        device
            .kernel("slice_gather")?
            .arg_buffer(x.data())
            .arg_buffer(out.data())
            .arg_index(out.dims())
            .arg_index(x.strides())
            .arg_index(&starts)
            .arg_index(&steps)
            .arg_usize(ranges.len())
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(out)
    }

    fn slice_accumulate(
        device: &Device,
        dst: &mut DeviceStorage,
        dst_shape: &Shape,
        src: &DeviceStorage,
        src_layout: &Layout,
        ranges: &[ResolvedRange],
    ) -> Result<()> {
        check_device(device, dst)?;
        let sliced = sliced_shape(ranges);
        if ranges.len() != dst_shape.rank() || sliced.elem_count() != src_layout.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: sliced,
                got: src_layout.shape().clone(),
            });
        }
        let s = ensure_contiguous(device, src, src_layout)?;
        let src_dims = device.index_buffer(sliced.dims())?;
        let dst_strides = device.index_buffer(&dst_shape.stride_contiguous())?;
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        let steps: Vec<usize> = ranges.iter().map(|r| r.step).collect();
        let (starts, steps) = (device.index_buffer(&starts)?, device.index_buffer(&steps)?);
        let n = sliced.elem_count();
        device
            .kernel("slice_scatter_add")?
            .arg_buffer(dst.data())
            .arg_buffer(s.data())
            .arg_index(&src_dims)
            .arg_index(&dst_strides)
            .arg_index(&starts)
            .arg_index(&steps)
            .arg_usize(ranges.len())
            .arg_usize(n)
            .global(&[n])
            .launch()?;
        Ok(())
    }

    fn concat(
        device: &Device,
        inputs: &[Operand<'_, DeviceStorage>],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<DeviceStorage> {
        if dim >= out_shape.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: out_shape.rank(),
            });
        }
        let out = DeviceStorage::zeros(device, out_shape)?;
        let inner_out: usize = out_shape.dims()[dim..].iter().product();
        let mut offset = 0;
        for (storage, layout) in inputs {
            let x = ensure_contiguous(device, storage, layout)?;
            let inner_in: usize = layout.dims()[dim..].iter().product();
            let n = layout.elem_count();
            device
                .kernel("concat_copy")?
                .arg_buffer(x.data())
                .arg_buffer(out.data())
                .arg_usize(inner_in)
                .arg_usize(inner_out)
                .arg_usize(offset)
                .arg_usize(n)
                .global(&[n])
                .launch()?;
            offset += inner_in;
        }
        Ok(out)
    }

    //  Fused kernels

    fn flash_attention(
        device: &Device,
        operands: AttentionOperands<'_, DeviceStorage>,
        params: &AttentionParams,
    ) -> Result<Option<(DeviceStorage, DeviceStorage)>> {
        let (q, ql) = operands.q;
        let (k, kl) = operands.k;
        let (v, vl) = operands.v;
        let (Some((batch, seq_q, d)), Some((_, seq_k, _)), Some((_, _, dv))) =
            (attention_dims(ql), attention_dims(kl), attention_dims(vl))
        else {
            return Ok(None);
        };
        if dv != d {
            return Ok(None);
        }
        let qc = ensure_contiguous(device, q, ql)?;
        let kc = ensure_contiguous(device, k, kl)?;
        let vc = ensure_contiguous(device, v, vl)?;
        let out = DeviceStorage::zeros(device, ql.shape())?;
        let lse = DeviceStorage::zeros(device, &Shape::from(&ql.dims()[..ql.rank() - 1]))?;
        device
            .kernel("flash_attention_forward")?
            .arg_buffer(qc.data())
            .arg_buffer(kc.data())
            .arg_buffer(vc.data())
            .arg_buffer(out.data())
            .arg_buffer(lse.data())
            .arg_usize(batch)
            .arg_usize(seq_q)
            .arg_usize(seq_k)
            .arg_usize(d)
            .arg_float(params.scale)
            .arg_int(params.causal as i32)
            .arg_usize(device.config().attention_tile)
            .global(&[seq_q, batch])
            .launch()?;
        Ok(Some((out, lse)))
    }

    fn flash_attention_backward(
        device: &Device,
        operands: AttentionBackwardOperands<'_, DeviceStorage>,
        params: &AttentionParams,
    ) -> Result<Option<AttentionGrads<DeviceStorage>>> {
        let AttentionBackwardOperands {
            inputs,
            output,
            lse,
            grad,
        } = operands;
        let (q, ql) = inputs.q;
        let (k, kl) = inputs.k;
        let (v, vl) = inputs.v;
        let (Some((batch, seq_q, d)), Some((_, seq_k, _)), Some((_, _, dv))) =
            (attention_dims(ql), attention_dims(kl), attention_dims(vl))
        else {
            return Ok(None);
        };
        if dv != d {
            return Ok(None);
        }
        expect_shape(ql.shape(), grad.1.shape())?;
        let qc = ensure_contiguous(device, q, ql)?;
        let kc = ensure_contiguous(device, k, kl)?;
        let vc = ensure_contiguous(device, v, vl)?;
        let oc = ensure_contiguous(device, output.0, output.1)?;
        let lc = ensure_contiguous(device, lse.0, lse.1)?;
        let gc = ensure_contiguous(device, grad.0, grad.1)?;

        let rows = batch * seq_q;
        let delta = device.create_buffer::<f32>(rows)?;
        device
            .kernel("flash_attention_backward_delta")?
            .arg_buffer(oc.data())
            .arg_buffer(gc.data())
            .arg_buffer(&delta)
            .arg_usize(rows)
            .arg_usize(d)
            .global(&[rows])
            .launch()?;

        let tile = device.config().attention_tile;
        let dq = DeviceStorage::zeros(device, ql.shape())?;
        device
            .kernel("flash_attention_backward_dq")?
            .arg_buffer(qc.data())
            .arg_buffer(kc.data())
            .arg_buffer(vc.data())
            .arg_buffer(gc.data())
            .arg_buffer(lc.data())
            .arg_buffer(&delta)
            .arg_buffer(dq.data())
            .arg_usize(batch)
            .arg_usize(seq_q)
            .arg_usize(seq_k)
            .arg_usize(d)
            .arg_float(params.scale)
            .arg_int(params.causal as i32)
            .arg_usize(tile)
            .global(&[seq_q, batch])
            .launch()?;

        let dk = DeviceStorage::zeros(device, kl.shape())?;
        let dvs = DeviceStorage::zeros(device, vl.shape())?;
        device
            .kernel("flash_attention_backward_dkdv")?
            .arg_buffer(qc.data())
            .arg_buffer(kc.data())
            .arg_buffer(vc.data())
            .arg_buffer(gc.data())
            .arg_buffer(lc.data())
            .arg_buffer(&delta)
            .arg_buffer(dk.data())
            .arg_buffer(dvs.data())
            .arg_usize(batch)
            .arg_usize(seq_q)
            .arg_usize(seq_k)
            .arg_usize(d)
            .arg_float(params.scale)
            .arg_int(params.causal as i32)
            .arg_usize(tile)
            .global(&[seq_k, batch])
            .launch()?;

        Ok(Some(AttentionGrads {
            dq,
            dk,
            dv: dvs,
        }))
    }
}
