// Matrix multiplication
//
// [batch..., m, k] @ [batch..., k, n] → [batch..., m, n], with the batch dims
// broadcast. Operands are read through their layouts, so transposed views
// never need a copy. Per matrix the inner loop picks one of:
//
//   row × row       B rows contiguous: C[i,:] += A[i,p] · B[p,:]   (axpy)
//   row × column    B is a transposed view: C[i,j] = A[i,:] · B[:,j] (dot)
//   strided         anything else
//
// Output rows (over all batches) are split across workers.

use vela_core::layout::unravel_index;
use vela_core::{Error, Layout, Result, Shape};

use crate::config::HostConfig;
use crate::parallel::for_each_row_block;
use crate::simd;

/// One operand's matrix geometry: per-batch offsets plus row/col strides.
struct MatrixView {
    offsets: Vec<usize>,
    row_stride: usize,
    col_stride: usize,
}

impl MatrixView {
    fn new(layout: &Layout, out_batch: &Shape) -> Result<Self> {
        let rank = layout.rank();
        let dims = layout.dims();
        let strides = layout.strides();
        let batch_shape = Shape::from(&dims[..rank - 2]);
        let batch_strides = batch_shape.broadcast_strides(&strides[..rank - 2], out_batch)?;
        let count = out_batch.elem_count();
        let mut coords = vec![0; out_batch.rank()];
        let offsets = (0..count)
            .map(|b| {
                unravel_index(b, out_batch.dims(), &mut coords);
                coords.iter().zip(&batch_strides).map(|(c, s)| c * s).sum()
            })
            .collect();
        Ok(MatrixView {
            offsets,
            row_stride: strides[rank - 2],
            col_stride: strides[rank - 1],
        })
    }
}

pub fn matmul(
    cfg: &HostConfig,
    lhs: &[f32],
    lhs_layout: &Layout,
    rhs: &[f32],
    rhs_layout: &Layout,
    out_shape: &Shape,
) -> Result<Vec<f32>> {
    let (_, m, k) = lhs_layout.shape().matrix_dims()?;
    let (_, k2, n) = rhs_layout.shape().matrix_dims()?;
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
    let a = MatrixView::new(lhs_layout, &out_batch)?;
    let b = MatrixView::new(rhs_layout, &out_batch)?;

    let mut out = vec![0.0f32; out_shape.elem_count()];
    if out.is_empty() || k == 0 {
        return Ok(out);
    }

    let a_rows_contiguous = a.col_stride == 1 || k == 1;
    let b_rows_contiguous = b.col_stride == 1 || n == 1;
    let b_cols_contiguous = b.row_stride == 1 || k == 1;

    for_each_row_block(cfg, &mut out, n, |first_row, block| {
        for (r, c_row) in block.chunks_mut(n).enumerate() {
            let row = first_row + r;
            let (batch, i) = (row / m, row % m);
            let a_base = a.offsets[batch] + i * a.row_stride;
            let b_base = b.offsets[batch];

            if a_rows_contiguous && b_cols_contiguous && !b_rows_contiguous {
                let a_row = &lhs[a_base..a_base + k];
                for (j, c) in c_row.iter_mut().enumerate() {
                    let start = b_base + j * b.col_stride;
                    *c = simd::dot(a_row, &rhs[start..start + k]);
                }
            } else if b_rows_contiguous {
                for p in 0..k {
                    let av = lhs[a_base + p * a.col_stride];
                    let start = b_base + p * b.row_stride;
                    simd::axpy(av, &rhs[start..start + n], c_row);
                }
            } else {
                for (j, c) in c_row.iter_mut().enumerate() {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        acc += lhs[a_base + p * a.col_stride]
                            * rhs[b_base + p * b.row_stride + j * b.col_stride];
                    }
                    *c = acc;
                }
            }
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    #[test]
    fn plain_2d() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
        let la = Layout::contiguous(Shape::from((2, 3)));
        let lb = Layout::contiguous(Shape::from((3, 2)));
        let c = matmul(&HostConfig::sequential(), &a, &la, &b, &lb, &Shape::from((2, 2))).unwrap();
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn transposed_rhs_uses_strides() {
        // bt holds B^T (2x3); the view transposes it back to 3x2
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bt = vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0];
        let la = Layout::contiguous(Shape::from((2, 3)));
        let lb = Layout::contiguous(Shape::from((2, 3))).transpose(0, 1).unwrap();
        let c = matmul(&HostConfig::sequential(), &a, &la, &bt, &lb, &Shape::from((2, 2))).unwrap();
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn broadcast_batch() {
        let a: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..6).map(|i| (i as f32) * 0.5).collect();
        let la = Layout::contiguous(Shape::from((2, 2, 3)));
        let lb = Layout::contiguous(Shape::from((3, 2)));
        let cfg = HostConfig::default().with_parallel_threshold(0).with_workers(3);
        let c = matmul(&cfg, &a, &la, &b, &lb, &Shape::from((2, 2, 2))).unwrap();
        let mut expected = naive(&a[..6], &b, 2, 3, 2);
        expected.extend(naive(&a[6..], &b, 2, 3, 2));
        assert_eq!(c, expected);
    }

    #[test]
    fn inner_dim_mismatch() {
        let la = Layout::contiguous(Shape::from((2, 3)));
        let lb = Layout::contiguous(Shape::from((4, 2)));
        let err = matmul(
            &HostConfig::sequential(),
            &[0.0; 6],
            &la,
            &[0.0; 8],
            &lb,
            &Shape::from((2, 2)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MatmulShapeMismatch { k1: 3, k2: 4, .. }));
    }
}
