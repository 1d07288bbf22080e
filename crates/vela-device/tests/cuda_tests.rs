// CUDA Tests — the same kernels on real hardware
//
// Run with: `cargo test -p vela-device --features cuda`
//
// Needs a CUDA device 0 and NVRTC. Every kernel program is compiled from
// source when the device is set up; results are checked against the host
// backend and the emulator, and driver errors against the driver's codes.

#[cfg(all(test, feature = "cuda"))]
mod tests {
    use cudarc::driver::sys::CUresult;
    use vela_core::error::status;
    use vela_core::{Conv2dParams, DeviceError, Error, Pool2dParams, Shape, SliceRange};
    use vela_cpu::{CpuDevice, CpuTensor};
    use vela_device::{init_kernels, Device, DeviceConfig, DeviceTensor};

    fn gpu() -> Device {
        let device = Device::cuda(0).expect("CUDA device 0 not available — skip CUDA tests");
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

    fn pair(shape: impl Into<Shape>, seed: u64, device: &Device) -> (CpuTensor, DeviceTensor) {
        let host = CpuTensor::randn_seeded(shape, seed, &CpuDevice::default()).unwrap();
        let dev = host.to_backend(device).unwrap();
        (host, dev)
    }

    fn assert_same(host: &CpuTensor, dev: &DeviceTensor, tol: f32) {
        assert_eq!(host.shape(), dev.shape());
        assert_approx_vec(&dev.data().unwrap(), &host.data().unwrap(), tol);
    }

    fn device_error(err: Error) -> DeviceError {
        match err {
            Error::Device(e) => e,
            other => panic!("expected a device error, got {other}"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Program build
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_programs_compile_and_register() {
        let d = gpu();
        assert!(!d.is_emulated());
        assert!(d.kernels_initialized());
        let count = d.kernel_count();
        init_kernels(&d).unwrap();
        assert_eq!(d.kernel_count(), count);
        for name in ["fill", "binary_generic", "sum_axes", "matmul_batched", "flash_attention_forward"] {
            assert!(d.kernel(name).is_ok(), "{name} not registered");
        }
    }

    #[test]
    fn test_factories_and_transfer() {
        let d = gpu();
        assert_eq!(DeviceTensor::zeros((2, 3), &d).unwrap().data().unwrap(), vec![0.0; 6]);
        assert_eq!(DeviceTensor::full(5, 2.5, &d).unwrap().data().unwrap(), vec![2.5; 5]);
        let (host, dev) = pair((3, 4), 1, &d);
        assert_same(&host, &dev, 0.0);
        dev.set(&[2, 1], -4.0).unwrap();
        assert_eq!(dev.get(&[2, 1]).unwrap(), -4.0);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Kernels against the host
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_elementwise_and_broadcast() {
        let d = gpu();
        let (a, da) = pair((2, 3, 4), 2, &d);
        for (shape, seed) in [(Shape::from(4), 3), (Shape::from((2, 1, 4)), 4), (Shape::from((3, 1)), 5)] {
            let (b, db) = pair(shape, seed, &d);
            assert_same(&a.add_grad(&b).unwrap(), &da.add_grad(&db).unwrap(), 1e-6);
            assert_same(&b.div_grad(&a).unwrap(), &db.div_grad(&da).unwrap(), 1e-5);
        }
        assert_same(&a.gelu().unwrap(), &da.gelu().unwrap(), 1e-5);
        assert_same(&a.silu().unwrap(), &da.silu().unwrap(), 1e-5);
        assert_same(&a.mul_scalar(-3.0).unwrap(), &da.mul_scalar(-3.0).unwrap(), 1e-6);
    }

    #[test]
    fn test_reduce_norm_matmul() {
        let d = gpu();
        let (x, dx) = pair((2, 3, 4), 6, &d);
        let target = Shape::from((3, 1));
        assert_same(&x.sum_to_shape(&target).unwrap(), &dx.sum_to_shape(&target).unwrap(), 1e-5);
        let (y, dy) = pair((5, 9), 7, &d);
        assert_same(&y.softmax().unwrap(), &dy.softmax().unwrap(), 1e-5);
        assert_same(&y.normalize(1e-5).unwrap(), &dy.normalize(1e-5).unwrap(), 1e-4);
        let (a, da) = pair((2, 3, 5, 7), 8, &d);
        let (b, db) = pair((3, 7, 4), 9, &d);
        assert_same(&a.matmul(&b).unwrap(), &da.matmul(&db).unwrap(), 1e-3);
    }

    #[test]
    fn test_conv_pool_slice() {
        let d = gpu();
        let (x, dx) = pair((2, 3, 7, 6), 10, &d);
        let (w, dw) = pair((4, 3, 3, 2), 11, &d);
        let params = Conv2dParams {
            stride: [2, 1],
            padding: [1, 0],
        };
        assert_same(&x.conv2d(&w, params).unwrap(), &dx.conv2d(&dw, params).unwrap(), 1e-4);
        let pool = Pool2dParams::square(2);
        assert_same(&x.max_pool2d(pool).unwrap(), &dx.max_pool2d(pool).unwrap(), 0.0);
        let ranges = [
            SliceRange::all(),
            SliceRange::stepped(0, 3, 2),
            SliceRange::interval(1, 6),
            SliceRange::all(),
        ];
        assert_same(&x.slice(&ranges).unwrap(), &dx.slice(&ranges).unwrap(), 0.0);
    }

    #[test]
    fn test_attention_matches_emulator() {
        let d = gpu();
        let emu = Device::with_config(DeviceConfig::emulator()).unwrap();
        init_kernels(&emu).unwrap();
        let q = CpuTensor::randn_seeded((2, 5, 8), 12, &CpuDevice::default()).unwrap();
        let k = CpuTensor::randn_seeded((2, 7, 8), 13, &CpuDevice::default()).unwrap();
        let v = CpuTensor::randn_seeded((2, 7, 8), 14, &CpuDevice::default()).unwrap();
        let run = |dev: &Device| {
            let (q, k, v) = (
                q.to_backend(dev).unwrap(),
                k.to_backend(dev).unwrap(),
                v.to_backend(dev).unwrap(),
            );
            q.flash_attention(&k, &v, true).unwrap().unwrap().data().unwrap()
        };
        assert_approx_vec(&run(&d), &run(&emu), 1e-4);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Errors carry driver codes
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_status_codes() {
        let d = gpu();
        let err = d.kernel("no_such_kernel").err().unwrap();
        assert_eq!(device_error(err).code(), CUresult::CUDA_ERROR_NOT_FOUND as i32);
        assert_eq!(status::NOT_FOUND, CUresult::CUDA_ERROR_NOT_FOUND as i32);

        let err = device_error(Device::cuda(4096).unwrap_err());
        assert!(matches!(err, DeviceError::Driver { .. }), "{err:?}");
        assert_eq!(err.code(), CUresult::CUDA_ERROR_INVALID_DEVICE as i32);
    }
}
