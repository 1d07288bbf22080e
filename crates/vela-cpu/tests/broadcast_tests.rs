// Broadcast Engine Tests — every fast path must agree with the generic
// strided fallback, sequentially and with fork-join splitting.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use vela_core::{BinaryOp, Layout, Shape};
    use vela_cpu::broadcast::{binary, binary_generic, binary_inplace, plan, sum_to_shape, Plan};
    use vela_cpu::HostConfig;

    fn eager() -> HostConfig {
        HostConfig::default()
            .with_parallel_threshold(0)
            .with_grain_size(5)
            .with_workers(3)
    }

    fn op_strategy() -> impl Strategy<Value = BinaryOp> {
        prop_oneof![
            Just(BinaryOp::Add),
            Just(BinaryOp::Sub),
            Just(BinaryOp::Mul),
            Just(BinaryOp::Div),
        ]
    }

    /// A full shape plus a compatible smaller shape: some dims set to 1 and
    /// possibly some leading dims dropped.
    fn shape_pair() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
        prop::collection::vec(1usize..5, 1..5).prop_flat_map(|full| {
            let rank = full.len();
            (
                Just(full),
                prop::collection::vec(any::<bool>(), rank),
                0..rank,
            )
                .prop_map(|(full, ones, drop)| {
                    let small: Vec<usize> = full
                        .iter()
                        .zip(&ones)
                        .map(|(&d, &one)| if one { 1 } else { d })
                        .skip(drop)
                        .collect();
                    (full, small)
                })
        })
    }

    fn values(n: usize, salt: usize) -> Vec<f32> {
        // avoid zeros so Div stays finite
        (0..n)
            .map(|i| ((i * 7 + salt * 13) % 19) as f32 - 9.5)
            .collect()
    }

    proptest! {
        #[test]
        fn fast_paths_match_generic((full, small) in shape_pair(), op in op_strategy(), swap in any::<bool>()) {
            let (ls, rs) = if swap { (small, full) } else { (full, small) };
            let la = Layout::contiguous(Shape::from(ls));
            let lb = Layout::contiguous(Shape::from(rs));
            let a = values(la.elem_count(), 1);
            let b = values(lb.elem_count(), 2);
            for cfg in [HostConfig::sequential(), eager()] {
                let fast = binary(&cfg, op, &a, &la, &b, &lb).unwrap();
                let slow = binary_generic(&cfg, op, &a, &la, &b, &lb).unwrap();
                prop_assert_eq!(&fast, &slow);
            }
        }

        #[test]
        fn inplace_matches_out_of_place((full, small) in shape_pair(), op in op_strategy()) {
            let la = Layout::contiguous(Shape::from(full));
            let lb = Layout::contiguous(Shape::from(small));
            let a = values(la.elem_count(), 3);
            let b = values(lb.elem_count(), 4);
            let expected = binary_generic(&HostConfig::sequential(), op, &a, &la, &b, &lb).unwrap();
            let mut inplace = a.clone();
            binary_inplace(&eager(), op, &mut inplace, &la, &b, &lb).unwrap();
            prop_assert_eq!(inplace, expected);
        }

        #[test]
        fn sum_to_shape_inverts_broadcast((full, small) in shape_pair()) {
            // broadcasting ones then summing back counts the copies of each element
            let target = Shape::from(small);
            let full = Shape::from(full);
            let ones = vec![1.0f32; full.elem_count()];
            let layout = Layout::contiguous(full.clone());
            let sums = sum_to_shape(&eager(), &ones, &layout, &target).unwrap();
            let copies = (full.elem_count() / target.elem_count().max(1)) as f32;
            prop_assert!(sums.iter().all(|&s| s == copies));
        }
    }

    #[test]
    fn documented_fast_paths_are_selected() {
        let m = Layout::contiguous(Shape::from((4, 3)));
        let v = Layout::contiguous(Shape::from(3));
        assert!(matches!(plan(&m, &v, m.shape()), Plan::RhsPattern(_)));

        let t = Layout::contiguous(Shape::from((2, 4, 3)));
        assert!(matches!(plan(&t, &m, t.shape()), Plan::RhsPattern(_)));
        assert!(matches!(plan(&t, &v, t.shape()), Plan::RhsPattern(_)));
        assert_eq!(plan(&t, &t, t.shape()), Plan::Same);

        let col = Layout::contiguous(Shape::from((4, 1)));
        let row = Layout::contiguous(Shape::from((1, 3)));
        assert_eq!(plan(&col, &row, m.shape()), Plan::Generic);
    }

    #[test]
    fn strided_operands_use_generic_path() {
        let a: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let la = Layout::contiguous(Shape::from((3, 4))).transpose(0, 1).unwrap();
        let b = vec![100.0, 200.0, 300.0];
        let lb = Layout::contiguous(Shape::from(3));
        assert_eq!(plan(&la, &lb, la.shape()), Plan::Generic);
        let out = binary(&eager(), BinaryOp::Add, &a, &la, &b, &lb).unwrap();
        // row r of the view is column r of the source
        assert_eq!(&out[..3], &[100.0, 204.0, 308.0]);
        assert_eq!(&out[9..], &[103.0, 207.0, 311.0]);
    }

    #[test]
    fn large_inputs_split_across_threads() {
        let n = 200_000;
        let a = vec![1.5f32; n];
        let b = vec![2.0f32; n];
        let l = Layout::contiguous(Shape::from(n));
        let out = binary(&HostConfig::default(), BinaryOp::Mul, &a, &l, &b, &l).unwrap();
        assert!(out.iter().all(|&v| v == 3.0));
    }
}
