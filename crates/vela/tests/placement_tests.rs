// Placement Tests — moving tensors between the host and devices through
// the facade, and running the same computation on both.

#[cfg(test)]
mod tests {
    use vela::prelude::*;
    use vela::HostConfig;

    fn device() -> Device {
        let device = Device::emulator().unwrap();
        init_kernels(&device).unwrap();
        device
    }

    fn assert_approx_vec(actual: &[f32], expected: &[f32], tol: f32) {
        assert_eq!(actual.len(), expected.len(), "length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!((a - e).abs() <= tol * (1.0 + e.abs()), "index {i}: {a} != {e}");
        }
    }

    #[test]
    fn test_round_trip_through_device() {
        let d = device();
        let host = CpuTensor::arange(6, &CpuDevice::default())
            .unwrap()
            .reshape((2, 3))
            .unwrap();
        let any = AnyTensor::from(host.clone());
        assert!(any.is_host());

        let on_device = any.to(Some(&d)).unwrap();
        assert!(!on_device.is_host());
        assert!(on_device.device().unwrap().same_device(&d));
        assert_eq!(on_device.dims(), &[2, 3]);

        let back = on_device.to(None).unwrap();
        assert!(back.is_host());
        assert_eq!(back.data().unwrap(), host.data().unwrap());
        assert_eq!(back.into_host().unwrap().data().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_move_to_same_place_shares_storage() {
        let d = device();
        let t = DeviceTensor::ones(4, &d).unwrap();
        let any = AnyTensor::from(t.clone());
        let same = any.to(Some(&d)).unwrap();
        assert!(same.as_device().unwrap().shares_storage(&t));

        let other = device();
        let moved = any.to(Some(&other)).unwrap();
        assert!(moved.device().unwrap().same_device(&other));
        assert!(!moved.as_device().unwrap().shares_storage(&t));
        assert_eq!(moved.data().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_same_model_on_both_backends() {
        let d = device();
        let x = CpuTensor::randn_seeded((3, 4), 1, &CpuDevice::default()).unwrap();
        let w = CpuTensor::randn_seeded((4, 2), 2, &CpuDevice::default()).unwrap();

        let host_out = x.matmul(&w).unwrap().relu().unwrap().softmax().unwrap();

        let dx = AnyTensor::from(x).to(Some(&d)).unwrap();
        let dw = AnyTensor::from(w).to(Some(&d)).unwrap();
        let (dx, dw) = (dx.as_device().unwrap(), dw.as_device().unwrap());
        let dev_out = dx.matmul(dw).unwrap().relu().unwrap().softmax().unwrap();

        let dev_out = AnyTensor::from(dev_out).into_host().unwrap();
        assert_approx_vec(&dev_out.data().unwrap(), &host_out.data().unwrap(), 1e-4);
    }

    #[test]
    fn test_moved_tensor_is_an_untracked_leaf() {
        let x = CpuTensor::ones(3, &CpuDevice::default()).unwrap().with_grad();
        let y = x.scale_grad(2.0).unwrap();
        let moved = AnyTensor::from(y).to(Some(&device())).unwrap();
        assert!(!moved.as_device().unwrap().uses_grad());
    }

    #[test]
    fn test_host_config_survives_the_trip_back() {
        let d = device();
        let host = CpuDevice::with_config(HostConfig::sequential().with_grain_size(64));
        let on_device = AnyTensor::from(DeviceTensor::ones((2, 2), &d).unwrap());

        let back = on_device.to_host_on(&host).unwrap();
        let back = back.as_host().unwrap();
        assert_eq!(back.device().config(), host.config());
        assert_eq!(back.data().unwrap(), vec![1.0; 4]);
        // work done afterwards runs with the same config
        assert_eq!(back.add_scalar(1.0).unwrap().device().config(), host.config());

        let owned = on_device.clone().into_host_on(&host).unwrap();
        assert_eq!(owned.device().config(), host.config());

        // the plain move still lands on a default host
        let default_back = on_device.to(None).unwrap().into_host().unwrap();
        assert_eq!(default_back.device().config(), &HostConfig::default());
    }
}
