// Autograd Tests — analytic gradients against central finite differences,
// gradient accumulation, graph bookkeeping and error states.

#[cfg(test)]
mod tests {
    use vela_core::{
        Activation, BackwardOptions, Conv2dParams, Error, ErrorKind, LayerNormGradMode, Operation,
        Pool2dParams, Result, Shape, SliceRange,
    };
    use vela_cpu::{CpuDevice, CpuTensor};

    type T = CpuTensor;

    fn dev() -> CpuDevice {
        CpuDevice::default()
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

    /// ∂ sum(f(inputs)) / ∂ inputs[which], by central differences.
    fn numeric_grad(
        inputs: &[(Vec<f32>, Shape)],
        which: usize,
        f: &dyn Fn(&[T]) -> Result<T>,
    ) -> Vec<f32> {
        let h = 1e-2f32;
        let eval = |data: &[(Vec<f32>, Shape)]| -> f32 {
            let tensors: Vec<T> = data
                .iter()
                .map(|(v, s)| T::from_vec(v.clone(), s.clone(), &dev()).unwrap())
                .collect();
            f(&tensors).unwrap().sum_all().unwrap().item().unwrap()
        };
        let n = inputs[which].0.len();
        (0..n)
            .map(|i| {
                let mut plus = inputs.to_vec();
                let mut minus = inputs.to_vec();
                plus[which].0[i] += h;
                minus[which].0[i] -= h;
                (eval(&plus) - eval(&minus)) / (2.0 * h)
            })
            .collect()
    }

    /// Run `f` on tracked copies of `inputs`, backprop a ones seed from the
    /// sum, and check every input's gradient against finite differences.
    fn check_gradients(inputs: &[(Vec<f32>, Shape)], f: &dyn Fn(&[T]) -> Result<T>, tol: f32) {
        let tracked: Vec<T> = inputs
            .iter()
            .map(|(v, s)| {
                T::from_vec(v.clone(), s.clone(), &dev())
                    .unwrap()
                    .with_grad()
            })
            .collect();
        f(&tracked).unwrap().sum_grad().unwrap().backward().unwrap();
        for (which, t) in tracked.iter().enumerate() {
            let analytic = t.grad().unwrap().expect("input has a gradient");
            assert_eq!(analytic.shape(), t.shape());
            let numeric = numeric_grad(inputs, which, f);
            assert_approx_vec(&analytic.data().unwrap(), &numeric, tol);
        }
    }

    fn input(shape: impl Into<Shape>, seed: u64) -> (Vec<f32>, Shape) {
        let shape = shape.into();
        let t = T::randn_seeded(shape.clone(), seed, &dev()).unwrap();
        (t.data().unwrap(), shape)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Arithmetic
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_mul_add_matches_finite_differences() {
        let inputs = [input((2, 3), 1), input((2, 3), 2), input((2, 3), 3)];
        check_gradients(
            &inputs,
            &|t| t[0].mul_grad(&t[1])?.add_grad(&t[2]),
            2e-2,
        );
    }

    #[test]
    fn test_broadcast_sub_div() {
        let mut denom = input(3, 4);
        for v in denom.0.iter_mut() {
            *v = v.abs() + 1.0;
        }
        let inputs = [input((4, 3), 5), denom, input((4, 1), 6)];
        check_gradients(
            &inputs,
            &|t| t[0].div_grad(&t[1])?.sub_grad(&t[2]),
            2e-2,
        );
    }

    #[test]
    fn test_matmul_batched_broadcast() {
        let inputs = [input((2, 3, 4), 7), input((4, 5), 8)];
        check_gradients(&inputs, &|t| t[0].matmul_grad(&t[1]), 2e-2);
    }

    #[test]
    fn test_scale_mean() {
        let inputs = [input((3, 3), 9)];
        check_gradients(
            &inputs,
            &|t| t[0].scale_grad(3.0)?.mean_grad(),
            2e-2,
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Structural
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_slice_concat_reshape_transpose() {
        let inputs = [input((3, 4), 10), input((3, 2), 11)];
        check_gradients(
            &inputs,
            &|t| {
                let s = t[0].slice_grad(&[SliceRange::all(), SliceRange::stepped(0, 4, 2)])?;
                let c = T::concat_grad(&[&s, &t[1]], 1)?;
                let w = T::from_vec((0..12).map(|i| i as f32 * 0.1).collect(), (4, 3), &dev())?;
                c.transpose_grad(0, 1)?.reshape_grad((3, 4))?.mul_grad(&w.reshape((3, 4))?)
            },
            2e-2,
        );
    }

    #[test]
    fn test_squeeze_unsqueeze_permute() {
        let inputs = [input((2, 1, 3), 12)];
        let w = T::from_vec(vec![1.0, -2.0, 0.5, 3.0, 1.5, -1.0], (3, 2), &dev()).unwrap();
        check_gradients(
            &inputs,
            &|t| {
                t[0].squeeze_grad(1)?
                    .permute_grad(&[1, 0])?
                    .unsqueeze_grad(0)?
                    .mul_grad(&w)
            },
            2e-2,
        );
    }

    #[test]
    fn test_overlapping_slices_accumulate() {
        let x = T::from_vec(vec![1.0, 2.0, 3.0, 4.0], 4, &dev()).unwrap().with_grad();
        let a = x.slice_grad(&[SliceRange::interval(0, 3)]).unwrap();
        let b = x.slice_grad(&[SliceRange::interval(1, 4)]).unwrap();
        a.sum_grad().unwrap().add_grad(&b.sum_grad().unwrap()).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().unwrap().data().unwrap(), vec![1.0, 2.0, 2.0, 1.0]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Activations, softmax, normalization
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_activations() {
        for act in [
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Gelu,
            Activation::Silu,
        ] {
            let inputs = [input((2, 5), 13)];
            check_gradients(&inputs, &|t| t[0].activation_grad(act), 2e-2);
        }
    }

    #[test]
    fn test_softmax_weighted() {
        let inputs = [input((3, 4), 14)];
        let w = T::from_vec((0..12).map(|i| (i % 5) as f32).collect(), (3, 4), &dev()).unwrap();
        check_gradients(&inputs, &|t| t[0].softmax_grad()?.mul_grad(&w), 2e-2);
    }

    #[test]
    fn test_layer_norm_exact_mode() {
        let inputs = [input((2, 4), 15), input(4, 16), input(4, 17)];
        let w = T::from_vec((0..8).map(|i| i as f32 - 3.0).collect(), (2, 4), &dev()).unwrap();
        check_gradients(
            &inputs,
            &|t| {
                t[0].layer_norm_grad_with(&t[1], &t[2], 1e-5, LayerNormGradMode::Exact)?
                    .mul_grad(&w)
            },
            3e-2,
        );
    }

    #[test]
    fn test_layer_norm_reference_mode_passes_gradient_through() {
        let x = T::randn((2, 4), &dev()).unwrap().with_grad();
        let scale = T::randn(4, &dev()).unwrap().with_grad();
        let bias = T::randn(4, &dev()).unwrap().with_grad();
        let y = x.layer_norm_grad(&scale, &bias, 1e-5).unwrap();
        let seed = T::randn((2, 4), &dev()).unwrap();
        y.backward_with(&seed).unwrap();

        assert_eq!(x.grad().unwrap().unwrap().data().unwrap(), seed.data().unwrap());
        let expected_bias = seed.sum_to_shape(&Shape::from(4)).unwrap();
        assert_approx_vec(
            &bias.grad().unwrap().unwrap().data().unwrap(),
            &expected_bias.data().unwrap(),
            1e-5,
        );
        let normalized = x.normalize(1e-5).unwrap();
        let expected_scale = seed
            .binary(vela_core::BinaryOp::Mul, &normalized)
            .unwrap()
            .sum_to_shape(&Shape::from(4))
            .unwrap();
        assert_approx_vec(
            &scale.grad().unwrap().unwrap().data().unwrap(),
            &expected_scale.data().unwrap(),
            1e-5,
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Convolution, pooling, attention
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_conv2d() {
        let inputs = [input((2, 2, 5, 4), 18), input((3, 2, 3, 2), 19)];
        let params = Conv2dParams {
            stride: [2, 1],
            padding: [1, 1],
        };
        check_gradients(&inputs, &|t| t[0].conv2d_grad(&t[1], params)?.tanh_grad(), 3e-2);
    }

    #[test]
    fn test_max_pool() {
        // distinct values so the argmax is stable under perturbation
        let data: Vec<f32> = (0..32).map(|i| ((i * 11) % 32) as f32).collect();
        let inputs = [(data, Shape::from((1, 2, 4, 4)))];
        check_gradients(
            &inputs,
            &|t| t[0].max_pool2d_grad(Pool2dParams::square(2)),
            2e-2,
        );
    }

    #[test]
    fn test_attention_fallback_graph() {
        let inputs = [input((2, 3, 4), 20), input((2, 5, 4), 21), input((2, 5, 4), 22)];
        for causal in [false, true] {
            check_gradients(
                &inputs,
                &|t| {
                    let w: Vec<f32> = (0..24).map(|i| (i % 7) as f32 - 3.0).collect();
                    let w = T::from_vec(w, (2, 3, 4), &dev())?;
                    t[0].attention_grad(&t[1], &t[2], causal)?.mul_grad(&w)
                },
                3e-2,
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Graph bookkeeping
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_gradient_accumulates_over_paths() {
        // y = x·x + 3x  →  dy/dx = 2x + 3
        let x = T::from_vec(vec![1.0, -2.0, 0.5], 3, &dev()).unwrap().with_grad();
        let y = x.mul_grad(&x).unwrap().add_grad(&x.scale_grad(3.0).unwrap()).unwrap();
        y.backward().unwrap();
        assert_approx_vec(&x.grad().unwrap().unwrap().data().unwrap(), &[5.0, -1.0, 4.0], 1e-6);
    }

    #[test]
    fn test_stored_gradients_own_their_storage() {
        // add passes its gradient straight through to both inputs
        let a = T::from_vec(vec![1.0, 2.0], 2, &dev()).unwrap().with_grad();
        let b = T::from_vec(vec![3.0, 4.0], 2, &dev()).unwrap().with_grad();
        let c = a.add_grad(&b).unwrap();
        let seed = T::ones(2, &dev()).unwrap();
        c.backward_with(&seed).unwrap();

        let ga = a.grad().unwrap().unwrap();
        let gb = b.grad().unwrap().unwrap();
        assert!(!ga.shares_storage(&gb));
        assert!(!ga.shares_storage(&seed));
        assert!(!gb.shares_storage(&seed));

        ga.mul(&T::full(2, 10.0, &dev()).unwrap()).unwrap();
        assert_eq!(a.grad().unwrap().unwrap().data().unwrap(), vec![10.0, 10.0]);
        assert_eq!(gb.data().unwrap(), vec![1.0, 1.0]);
        assert_eq!(seed.data().unwrap(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_repeated_backward_accumulates_with_retained_graph() {
        let x = T::from_vec(vec![2.0], 1, &dev()).unwrap().with_grad();
        let y = x.mul_grad(&x).unwrap();
        let retain = BackwardOptions::default().retain_graph(true);
        y.backward_with_options(None, retain).unwrap();
        y.backward_with_options(None, retain).unwrap();
        assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 8.0);
        x.zero_grad().unwrap();
        assert!(x.grad().unwrap().is_none());
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 4.0);
        // without retain_graph the node is released after the pass
        assert!(y.operation().unwrap().is_none());
    }

    #[test]
    fn test_untracked_grad_ops_do_not_build_graph() {
        let a = T::ones(3, &dev()).unwrap();
        let b = T::ones(3, &dev()).unwrap();
        let c = a.add_grad(&b).unwrap();
        assert!(!c.requires_grad());
        assert!(c.operation().unwrap().is_none());
        assert_eq!(a.data().unwrap(), vec![1.0; 3]);
        let err = c.backward().unwrap_err();
        assert!(matches!(err, Error::NoAutogradContext));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_recorded_operation_and_inputs() {
        let a = T::ones((2, 2), &dev()).unwrap().with_grad();
        let b = T::ones((2, 2), &dev()).unwrap();
        let c = a.matmul_grad(&b).unwrap();
        assert!(c.requires_grad());
        assert_eq!(c.operation().unwrap(), Some(Operation::MatMul));
        assert!(a.is_leaf().unwrap());
        c.backward().unwrap();
        assert!(b.grad().unwrap().is_none());
        assert_eq!(a.grad().unwrap().unwrap().data().unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn test_seed_shape_must_match() {
        let a = T::ones((2, 2), &dev()).unwrap().with_grad();
        let y = a.scale_grad(2.0).unwrap();
        let seed = T::ones(4, &dev()).unwrap();
        assert!(matches!(y.backward_with(&seed), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_squeeze_of_non_unit_dim_is_rejected() {
        let x = T::ones((2, 3), &dev()).unwrap().with_grad();
        let err = x.squeeze_grad(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = Operation::Squeeze { dim: Some(0) }.compute(&[&x]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(x.squeeze_all_grad().unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_wrong_input_count() {
        let a = T::ones(2, &dev()).unwrap();
        let err = Operation::Add.compute(&[&a]).unwrap_err();
        assert!(matches!(err, Error::WrongInputCount { op: "add", expected: 2, got: 1 }));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
