// Device Tests — every kernel family checked against the host backend, plus
// the runtime itself: kernel registry, argument validation, fault
// reporting and memory accounting.
//
// These run on the emulated device so they need no GPU; `cuda_tests.rs`
// repeats the kernel checks on real hardware.

#[cfg(test)]
mod tests {
    use vela_core::error::status;
    use vela_core::{
        Conv2dParams, DeviceError, Error, ErrorKind, Pool2dParams, Shape, SliceRange,
    };
    use vela_cpu::{CpuDevice, CpuTensor};
    use vela_device::{init_kernels, Device, DeviceConfig, DeviceTensor};

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn device() -> Device {
        init_logging();
        let device = Device::emulator().unwrap();
        init_kernels(&device).unwrap();
        device
    }

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol * (1.0 + b.abs())
    }

    fn assert_approx_vec(actual: &[f32], expected: &[f32], tol: f32) {
        assert_eq!(actual.len(), expected.len(), "length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
        }
    }

    /// The same seeded normal data on the host and on `device`.
    fn pair(shape: impl Into<Shape>, seed: u64, device: &Device) -> (CpuTensor, DeviceTensor) {
        let host = CpuTensor::randn_seeded(shape, seed, &CpuDevice::default()).unwrap();
        let dev = host.to_backend(device).unwrap();
        (host, dev)
    }

    fn assert_same(host: &CpuTensor, dev: &DeviceTensor, tol: f32) {
        assert_eq!(host.shape(), dev.shape());
        assert_approx_vec(&dev.data().unwrap(), &host.data().unwrap(), tol);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Creation and transfer
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_factories() {
        let d = device();
        assert_eq!(DeviceTensor::zeros((2, 3), &d).unwrap().data().unwrap(), vec![0.0; 6]);
        assert_eq!(DeviceTensor::full(4, 1.5, &d).unwrap().data().unwrap(), vec![1.5; 4]);
        let seeded = |seed| DeviceTensor::rand_seeded(8, seed, &d).unwrap().data().unwrap();
        assert_eq!(seeded(3), seeded(3));
        assert!(seeded(3).iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn test_element_access_and_round_trip() {
        let d = device();
        let (host, dev) = pair((3, 4), 1, &d);
        assert_same(&host, &dev, 0.0);
        dev.set(&[1, 2], 9.0).unwrap();
        assert_eq!(dev.get(&[1, 2]).unwrap(), 9.0);
        let back: CpuTensor = dev.to_backend(&CpuDevice::default()).unwrap();
        assert_eq!(back.get(&[1, 2]).unwrap(), 9.0);
    }

    #[test]
    fn test_views_are_materialized() {
        let d = device();
        let (host, dev) = pair((2, 3, 4), 2, &d);
        let ht = host.permute(&[2, 0, 1]).unwrap();
        let dt = dev.permute(&[2, 0, 1]).unwrap();
        assert!(dt.is_contiguous());
        assert_same(&ht, &dt, 0.0);
        assert_same(&host.t().unwrap().contiguous().unwrap(), &dev.t().unwrap(), 0.0);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Element-wise and broadcast
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_binary_broadcast_paths() {
        let d = device();
        let (a, da) = pair((2, 3, 4), 3, &d);
        // same shape, trailing vector, middle stretch, leading operand small,
        // and a pattern only the generic kernel handles
        for (shape, seed) in [
            (Shape::from((2, 3, 4)), 4),
            (Shape::from(4), 5),
            (Shape::from((2, 1, 4)), 6),
            (Shape::from((3, 4)), 7),
            (Shape::from((3, 1)), 8),
        ] {
            let (b, db) = pair(shape, seed, &d);
            assert_same(&a.mul_grad(&b).unwrap(), &da.mul_grad(&db).unwrap(), 1e-6);
            assert_same(&b.sub_grad(&a).unwrap(), &db.sub_grad(&da).unwrap(), 1e-6);
        }
    }

    #[test]
    fn test_inplace_arithmetic() {
        let d = device();
        let (a, da) = pair((4, 3), 9, &d);
        let (b, db) = pair(3, 10, &d);
        let (c, dc) = pair((4, 1), 11, &d);
        a.add(&b).unwrap();
        da.add(&db).unwrap();
        a.mul(&c).unwrap();
        da.mul(&dc).unwrap();
        assert_same(&a, &da, 1e-6);
        let wide = DeviceTensor::zeros((5, 3), &d).unwrap();
        assert!(da.add(&wide).is_err());
    }

    #[test]
    fn test_scalar_and_activations() {
        let d = device();
        let (x, dx) = pair((3, 5), 13, &d);
        assert_same(&x.mul_scalar(2.5).unwrap(), &dx.mul_scalar(2.5).unwrap(), 1e-6);
        assert_same(&x.add_scalar(-1.0).unwrap(), &dx.add_scalar(-1.0).unwrap(), 1e-6);
        assert_same(&x.gelu().unwrap(), &dx.gelu().unwrap(), 1e-5);
        assert_same(&x.silu().unwrap(), &dx.silu().unwrap(), 1e-5);
        assert_same(&x.leaky_relu(0.1).unwrap(), &dx.leaky_relu(0.1).unwrap(), 1e-6);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reductions and normalization
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_sum_to_shape() {
        let d = device();
        let (x, dx) = pair((2, 3, 4), 14, &d);
        for target in [Shape::from((3, 4)), Shape::from((2, 1, 4)), Shape::from(()), Shape::from((3, 1))] {
            assert_same(
                &x.sum_to_shape(&target).unwrap(),
                &dx.sum_to_shape(&target).unwrap(),
                1e-5,
            );
        }
        assert!(dx.sum_to_shape(&Shape::from(5)).is_err());
    }

    #[test]
    fn test_softmax_and_normalize() {
        let d = device();
        let (x, dx) = pair((4, 7), 15, &d);
        assert_same(&x.softmax().unwrap(), &dx.softmax().unwrap(), 1e-5);
        assert_same(&x.normalize(1e-5).unwrap(), &dx.normalize(1e-5).unwrap(), 1e-4);
        let masked = DeviceTensor::full((1, 3), f32::NEG_INFINITY, &d).unwrap();
        assert_eq!(masked.softmax().unwrap().data().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_layer_norm_with_affine() {
        let d = device();
        let (x, dx) = pair((3, 6), 16, &d);
        let (s, ds) = pair(6, 17, &d);
        let (b, db) = pair(6, 18, &d);
        assert_same(
            &x.layer_norm(&s, &b, 1e-5).unwrap(),
            &dx.layer_norm(&ds, &db, 1e-5).unwrap(),
            1e-4,
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Matmul, convolution, pooling
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_matmul_batched_broadcast() {
        let d = device();
        let (a, da) = pair((2, 3, 5, 7), 19, &d);
        let (b, db) = pair((3, 7, 4), 20, &d);
        assert_same(&a.matmul(&b).unwrap(), &da.matmul(&db).unwrap(), 1e-3);
        let (c, dc) = pair((9, 17), 21, &d);
        let (e, de) = pair((17, 11), 22, &d);
        assert_same(&c.matmul(&e).unwrap(), &dc.matmul(&de).unwrap(), 1e-3);
        assert!(matches!(
            dc.matmul(&dc),
            Err(Error::MatmulShapeMismatch { k1: 17, k2: 9, .. })
        ));
    }

    #[test]
    fn test_matmul_transposed_operand() {
        let d = device();
        let (a, da) = pair((6, 4), 23, &d);
        let (b, db) = pair((5, 4), 24, &d);
        assert_same(
            &a.matmul(&b.t().unwrap()).unwrap(),
            &da.matmul(&db.t().unwrap()).unwrap(),
            1e-3,
        );
    }

    #[test]
    fn test_conv2d_and_pool() {
        let d = device();
        let (x, dx) = pair((2, 3, 7, 6), 25, &d);
        let (w, dw) = pair((4, 3, 3, 2), 26, &d);
        let params = Conv2dParams {
            stride: [2, 1],
            padding: [1, 0],
        };
        assert_same(&x.conv2d(&w, params).unwrap(), &dx.conv2d(&dw, params).unwrap(), 1e-4);
        let pool = Pool2dParams {
            kernel: [2, 3],
            stride: [2, 2],
        };
        assert_same(&x.max_pool2d(pool).unwrap(), &dx.max_pool2d(pool).unwrap(), 0.0);
        let bad = DeviceTensor::zeros((4, 2, 3, 3), &d).unwrap();
        assert_eq!(dx.conv2d(&bad, params).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_conv_and_pool_gradients_match_host() {
        let d = device();
        let (x, dx) = pair((1, 2, 5, 5), 28, &d);
        let (w, dw) = pair((3, 2, 3, 3), 29, &d);
        let params = Conv2dParams {
            stride: [1, 1],
            padding: [1, 1],
        };
        let run_host = |x: CpuTensor, w: CpuTensor| {
            let (x, w) = (x.with_grad(), w.with_grad());
            x.conv2d_grad(&w, params)
                .unwrap()
                .max_pool2d_grad(Pool2dParams::square(2))
                .unwrap()
                .sum_grad()
                .unwrap()
                .backward()
                .unwrap();
            (x.grad().unwrap().unwrap(), w.grad().unwrap().unwrap())
        };
        let run_dev = |x: DeviceTensor, w: DeviceTensor| {
            let (x, w) = (x.with_grad(), w.with_grad());
            x.conv2d_grad(&w, params)
                .unwrap()
                .max_pool2d_grad(Pool2dParams::square(2))
                .unwrap()
                .sum_grad()
                .unwrap()
                .backward()
                .unwrap();
            (x.grad().unwrap().unwrap(), w.grad().unwrap().unwrap())
        };
        let (hx, hw) = run_host(x, w);
        let (gx, gw) = run_dev(dx, dw);
        assert_same(&hx, &gx, 1e-4);
        assert_same(&hw, &gw, 1e-4);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Slicing and concatenation
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_slice_and_concat() {
        let d = device();
        let (x, dx) = pair((4, 6), 30, &d);
        let ranges = [SliceRange::stepped(0, 4, 2), SliceRange::interval(1, 5)];
        assert_same(&x.slice(&ranges).unwrap(), &dx.slice(&ranges).unwrap(), 0.0);
        let (y, dy) = pair((4, 2), 31, &d);
        assert_same(
            &CpuTensor::concat(&[&x, &y], 1).unwrap(),
            &DeviceTensor::concat(&[&dx, &dy], 1).unwrap(),
            0.0,
        );
    }

    #[test]
    fn test_overlapping_slice_gradients_accumulate() {
        let d = device();
        let x = DeviceTensor::from_vec((0..6).map(|v| v as f32).collect(), 6, &d)
            .unwrap()
            .with_grad();
        let a = x.slice_grad(&[SliceRange::interval(0, 4)]).unwrap();
        let b = x.slice_grad(&[SliceRange::interval(2, 6)]).unwrap();
        DeviceTensor::concat_grad(&[&a, &b], 0)
            .unwrap()
            .sum_grad()
            .unwrap()
            .backward()
            .unwrap();
        assert_eq!(
            x.grad().unwrap().unwrap().data().unwrap(),
            vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0]
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runtime
    // ─────────────────────────────────────────────────────────────────────

    fn device_error(err: Error) -> DeviceError {
        match err {
            Error::Device(e) => e,
            other => panic!("expected a device error, got {other}"),
        }
    }

    #[test]
    fn test_kernels_must_be_initialized() {
        let d = Device::emulator().unwrap();
        assert!(!d.kernels_initialized());
        let err = DeviceTensor::full(3, 1.0, &d).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(device_error(err), DeviceError::KernelsNotInitialized);

        init_kernels(&d).unwrap();
        let count = d.kernel_count();
        init_kernels(&d).unwrap();
        assert_eq!(d.kernel_count(), count);
        let err = d.kernel("no_such_kernel").err().unwrap();
        assert_eq!(device_error(err).code(), status::NOT_FOUND);
    }

    #[test]
    fn test_argument_validation() {
        let d = device();
        let out = d.create_buffer::<f32>(4).unwrap();
        let err = d
            .kernel("fill")
            .unwrap()
            .arg_buffer(&out)
            .arg_float(1.0)
            .global(&[4])
            .launch()
            .unwrap_err();
        assert_eq!(device_error(err).code(), status::INVALID_VALUE);

        let err = d
            .kernel("fill")
            .unwrap()
            .arg_buffer(&out)
            .arg_int(1)
            .arg_usize(4)
            .global(&[4])
            .launch()
            .unwrap_err();
        assert!(matches!(device_error(err), DeviceError::KernelArgs { .. }));

        let err = d
            .kernel("fill")
            .unwrap()
            .arg_buffer(&out)
            .arg_float(1.0)
            .arg_usize(4)
            .global(&[4])
            .local(&[2048])
            .launch()
            .unwrap_err();
        assert_eq!(device_error(err).code(), status::INVALID_VALUE);
    }

    #[test]
    fn test_fault_surfaces_at_synchronize() {
        let d = device();
        let out = d.create_buffer::<f32>(4).unwrap();
        // claims 8 elements in a 4-element buffer
        d.kernel("fill")
            .unwrap()
            .arg_buffer(&out)
            .arg_float(2.0)
            .arg_usize(8)
            .global(&[8])
            .launch()
            .unwrap();
        let err = d.synchronize().unwrap_err();
        assert!(matches!(device_error(err), DeviceError::KernelFault { .. }));
        // the fault is reported once; the device keeps working afterwards
        d.synchronize().unwrap();
        let t = DeviceTensor::full(2, 3.0, &d).unwrap();
        assert_eq!(t.data().unwrap(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_buffers_from_other_device_rejected() {
        let (d1, d2) = (device(), device());
        let foreign = d2.create_buffer::<f32>(4).unwrap();
        let err = d1
            .kernel("fill")
            .unwrap()
            .arg_buffer(&foreign)
            .arg_float(1.0)
            .arg_usize(4)
            .global(&[4])
            .launch()
            .unwrap_err();
        assert_eq!(device_error(err), DeviceError::DeviceMismatch);
    }

    #[test]
    fn test_memory_accounting() {
        let d = device();
        let baseline = d.memory_stats();
        {
            let t = DeviceTensor::zeros((16, 16), &d).unwrap();
            let stats = d.memory_stats();
            // data, dims and strides
            assert_eq!(stats.live_buffers, baseline.live_buffers + 3);
            assert!(stats.allocated_bytes >= baseline.allocated_bytes + 256 * 4);
            let _ = t.matmul(&t).unwrap().data().unwrap();
        }
        d.synchronize().unwrap();
        let after = d.memory_stats();
        assert_eq!(after.live_buffers, baseline.live_buffers);
        assert_eq!(after.allocated_bytes, baseline.allocated_bytes);
        assert!(after.peak_bytes >= 256 * 4);
    }

    #[test]
    fn test_memory_limit() {
        let d = Device::with_config(DeviceConfig::emulator().with_memory_limit(1024)).unwrap();
        init_kernels(&d).unwrap();
        let small = DeviceTensor::zeros(16, &d).unwrap();
        let err = DeviceTensor::zeros(1024, &d).unwrap_err();
        assert!(matches!(device_error(err), DeviceError::Allocation { .. }));
        assert_eq!(small.data().unwrap(), vec![0.0; 16]);
    }

    #[test]
    fn test_runtime_selection() {
        let d = Device::emulator().unwrap();
        assert!(d.is_emulated());
        assert!(format!("{d:?}").contains("emulator"));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_requires_feature() {
        let err = Device::cuda(0).unwrap_err();
        let err = device_error(err);
        assert!(matches!(err, DeviceError::Unavailable(_)));
        assert_eq!(err.code(), status::NO_DEVICE);
        assert!(Device::new().is_err());
    }
}
