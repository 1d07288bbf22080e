// Host Tensor Tests — views, slicing, reshape, element access and in-place
// arithmetic on the CPU backend.

#[cfg(test)]
mod tests {
    use vela_core::{Error, ErrorKind, Shape, SliceRange};
    use vela_cpu::{CpuDevice, CpuTensor};

    type T = CpuTensor;

    fn dev() -> CpuDevice {
        CpuDevice::default()
    }

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    fn assert_approx_vec(actual: &[f32], expected: &[f32], tol: f32) {
        assert_eq!(actual.len(), expected.len(), "length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!(approx(*a, *e, tol), "index {i}: {a} != {e} (tol={tol})");
        }
    }

    fn grid(rows: usize, cols: usize) -> T {
        let data = (0..rows * cols).map(|i| i as f32).collect();
        T::from_vec(data, (rows, cols), &dev()).unwrap()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_factories() {
        let d = dev();
        assert_eq!(T::zeros((2, 3), &d).unwrap().data().unwrap(), vec![0.0; 6]);
        assert_eq!(T::ones(4, &d).unwrap().data().unwrap(), vec![1.0; 4]);
        assert_eq!(T::full(3, 2.5, &d).unwrap().data().unwrap(), vec![2.5; 3]);
        assert_eq!(T::scalar(7.0, &d).unwrap().item().unwrap(), 7.0);
        assert_eq!(T::arange(4, &d).unwrap().data().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fresh_tensor_is_row_major() {
        let t = T::zeros((2, 3, 4), &dev()).unwrap();
        assert_eq!(t.strides(), &[12, 4, 1]);
        assert_eq!(t.strides().len(), t.rank());
        assert!(t.is_contiguous());
        assert_eq!(t.storage().unwrap().0.len(), t.elem_count());
    }

    #[test]
    fn test_randn_statistics() {
        let t = T::randn(4000, &dev()).unwrap();
        let data = t.data().unwrap();
        let mean: f32 = data.iter().sum::<f32>() / data.len() as f32;
        let var: f32 = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / data.len() as f32;
        assert!(mean.abs() < 0.1, "mean {mean}");
        assert!((var - 1.0).abs() < 0.15, "var {var}");
    }

    #[test]
    fn test_seeded_rand_is_reproducible() {
        let a = T::rand_seeded((3, 3), 11, &dev()).unwrap();
        let b = T::rand_seeded((3, 3), 11, &dev()).unwrap();
        assert_eq!(a.data().unwrap(), b.data().unwrap());
    }

    #[test]
    fn test_from_vec_count_mismatch() {
        let err = T::from_vec(vec![1.0; 5], (2, 3), &dev()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_transpose_example() {
        let a = T::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2), &dev()).unwrap();
        let b = a.transpose(0, 1).unwrap();
        assert_eq!(b.get(&[0, 1]).unwrap(), 3.0);
        assert!(b.is_transposed());
        assert!(b.shares_storage(&a));
        let c = b.deep_clone().unwrap();
        assert_eq!(c.data().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
        assert!(c.is_contiguous());
        assert_eq!(c.strides(), &[2, 1]);
    }

    #[test]
    fn test_mutating_view_mutates_source() {
        let a = grid(2, 3);
        let v = a.transpose(0, 1).unwrap();
        v.set(&[2, 1], 100.0).unwrap();
        assert_eq!(a.get(&[1, 2]).unwrap(), 100.0);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let a = grid(2, 2);
        let c = a.deep_clone().unwrap();
        c.set(&[0, 0], -1.0).unwrap();
        assert_eq!(a.get(&[0, 0]).unwrap(), 0.0);
        assert!(!c.shares_storage(&a));
    }

    #[test]
    fn test_permute_view() {
        let t = T::from_vec((0..24).map(|i| i as f32).collect(), (2, 3, 4), &dev()).unwrap();
        let p = t.permute(&[2, 0, 1]).unwrap();
        assert_eq!(p.dims(), &[4, 2, 3]);
        assert_eq!(p.get(&[3, 1, 2]).unwrap(), t.get(&[1, 2, 3]).unwrap());
        assert!(t.permute(&[0, 1]).is_err());
    }

    #[test]
    fn test_reshape_round_trip() {
        let t = T::randn((2, 3, 4), &dev()).unwrap();
        let back = t.reshape((6, 4)).unwrap().reshape((2, 3, 4)).unwrap();
        let a = t.data().unwrap();
        let b = back.data().unwrap();
        assert!(a.iter().zip(&b).all(|(x, y)| x.to_bits() == y.to_bits()));
        assert!(back.shares_storage(&t));
    }

    #[test]
    fn test_reshape_of_view_copies() {
        let t = grid(2, 3);
        let r = t.t().unwrap().reshape(6).unwrap();
        assert_eq!(r.data().unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(!r.shares_storage(&t));
    }

    #[test]
    fn test_reshape_size_mismatch() {
        let err = grid(2, 3).reshape((4, 2)).unwrap_err();
        assert!(matches!(err, Error::ReshapeElementMismatch { src: 6, dst: 8, .. }));
    }

    #[test]
    fn test_squeeze_unsqueeze() {
        let t = T::zeros((1, 3, 1), &dev()).unwrap();
        assert_eq!(t.squeeze(0).unwrap().dims(), &[3, 1]);
        let err = t.squeeze(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("size 3"));
        assert_eq!(t.squeeze_all().unwrap().dims(), &[3]);
        assert_eq!(t.unsqueeze(3).unwrap().dims(), &[1, 3, 1, 1]);
        assert!(t.squeeze(5).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Element access
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_get_out_of_bounds() {
        let t = grid(2, 3);
        let err = t.get(&[0, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        assert!(t.get(&[0]).is_err());
        assert!(t.set(&[2, 0], 1.0).is_err());
    }

    #[test]
    fn test_item_requires_single_element() {
        assert!(grid(2, 2).item().is_err());
        assert_eq!(T::full((1, 1), 3.0, &dev()).unwrap().item().unwrap(), 3.0);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Slicing and concatenation
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_slice_columns() {
        let a = grid(4, 4);
        let s = a.slice(&[SliceRange::all(), SliceRange::interval(1, 3)]).unwrap();
        assert_eq!(s.dims(), &[4, 2]);
        assert_eq!(
            s.data().unwrap(),
            vec![1.0, 2.0, 5.0, 6.0, 9.0, 10.0, 13.0, 14.0]
        );
        assert!(!s.shares_storage(&a));
    }

    #[test]
    fn test_slice_index_keeps_dim() {
        let s = grid(3, 3).slice(&[SliceRange::index(1)]).unwrap();
        assert_eq!(s.dims(), &[1, 3]);
        assert_eq!(s.data().unwrap(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_slice_errors() {
        let a = grid(2, 2);
        let too_many = a
            .slice(&[SliceRange::all(), SliceRange::all(), SliceRange::all()])
            .unwrap_err();
        assert!(matches!(too_many, Error::TooManySliceRanges { ranges: 3, rank: 2 }));
        let oob = a.slice(&[SliceRange::interval(1, 3)]).unwrap_err();
        assert_eq!(oob.kind(), ErrorKind::OutOfBounds);
    }

    #[test]
    fn test_concat() {
        let a = grid(2, 2);
        let b = T::full((2, 1), 9.0, &dev()).unwrap();
        let c = T::concat(&[&a, &b], 1).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.data().unwrap(), vec![0.0, 1.0, 9.0, 2.0, 3.0, 9.0]);
        let bad = T::zeros((3, 1), &dev()).unwrap();
        assert!(T::concat(&[&a, &bad], 1).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Direct arithmetic
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_inplace_add_broadcasts_rhs() {
        let a = grid(2, 3);
        let row = T::from_vec(vec![10.0, 20.0, 30.0], 3, &dev()).unwrap();
        a.add(&row).unwrap();
        assert_eq!(a.data().unwrap(), vec![10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
    }

    #[test]
    fn test_inplace_rejects_growing_receiver() {
        let a = T::zeros(3, &dev()).unwrap();
        let b = T::zeros((2, 3), &dev()).unwrap();
        let err = a.mul(&b).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(a.shape(), &Shape::from(3));
    }

    #[test]
    fn test_inplace_with_own_transpose() {
        let a = T::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2), &dev()).unwrap();
        let at = a.t().unwrap();
        a.add(&at).unwrap();
        assert_eq!(a.data().unwrap(), vec![2.0, 5.0, 5.0, 8.0]);
    }

    #[test]
    fn test_binary_is_pure() {
        let a = grid(2, 2);
        let b = T::full((2, 1), 2.0, &dev()).unwrap();
        let c = a.binary(vela_core::BinaryOp::Div, &b).unwrap();
        assert_approx_vec(&c.data().unwrap(), &[0.0, 0.5, 1.0, 1.5], 1e-6);
        assert_eq!(a.data().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_non_broadcastable() {
        let a = T::zeros(3, &dev()).unwrap();
        let b = T::zeros(4, &dev()).unwrap();
        let err = a.binary(vela_core::BinaryOp::Add, &b).unwrap_err();
        assert!(matches!(err, Error::NotBroadcastable { .. }));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Kernels through the tensor API
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_matmul_on_transposed_view() {
        let a = T::randn((5, 4), &dev()).unwrap();
        let b = T::randn((3, 4), &dev()).unwrap();
        let via_view = a.matmul(&b.t().unwrap()).unwrap();
        let via_copy = a.matmul(&b.t().unwrap().contiguous().unwrap()).unwrap();
        assert_approx_vec(&via_view.data().unwrap(), &via_copy.data().unwrap(), 1e-4);
    }

    #[test]
    fn test_matmul_shape_error() {
        let a = T::zeros((2, 3), &dev()).unwrap();
        let b = T::zeros((4, 2), &dev()).unwrap();
        let err = a.matmul(&b).unwrap_err();
        assert!(matches!(err, Error::MatmulShapeMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_softmax_and_normalize() {
        let x = T::from_vec(vec![1.0, 2.0, 3.0, 4.0, 4.0, 4.0], (2, 3), &dev()).unwrap();
        let s = x.softmax().unwrap().data().unwrap();
        assert!(approx(s[0] + s[1] + s[2], 1.0, 1e-6));
        assert_approx_vec(&s[3..], &[1.0 / 3.0; 3], 1e-6);
        let n = x.normalize(1e-5).unwrap().data().unwrap();
        assert_approx_vec(&n[3..], &[0.0; 3], 1e-6);
    }

    #[test]
    fn test_sum_and_mean() {
        let t = grid(3, 4);
        assert_eq!(t.sum_all().unwrap().item().unwrap(), 66.0);
        assert_eq!(t.mean_all().unwrap().item().unwrap(), 5.5);
        let cols = t.sum_to_shape(&Shape::from((1, 4))).unwrap();
        assert_eq!(cols.data().unwrap(), vec![12.0, 15.0, 18.0, 21.0]);
    }

    #[test]
    fn test_attention_falls_back_on_host() {
        let q = T::randn((2, 4, 8), &dev()).unwrap();
        let k = T::randn((2, 6, 8), &dev()).unwrap();
        let v = T::randn((2, 6, 8), &dev()).unwrap();
        assert!(q.flash_attention(&k, &v, false).unwrap().is_none());
        let out = q.attention(&k, &v, true).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
        let explicit = q.scaled_dot_product_attention(&k, &v, true).unwrap();
        assert_approx_vec(&out.data().unwrap(), &explicit.data().unwrap(), 1e-6);
    }
}
