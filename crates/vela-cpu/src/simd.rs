//! Lane-chunked f32 kernels.
//!
//! The portable paths process `LANES` elements per step out of fixed-size
//! arrays, which the compiler turns into vector code. On x86_64 the dot
//! product and axpy also have AVX2 versions selected at runtime.

pub const LANES: usize = 8;

#[cfg(target_arch = "x86_64")]
pub fn has_avx2() -> bool {
    is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_avx2() -> bool {
    false
}

/// out[i] = f(a[i], b[i])
#[inline]
pub fn zip_map(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32) {
    let n = out.len().min(a.len()).min(b.len());
    let (a, b, out) = (&a[..n], &b[..n], &mut out[..n]);
    let mut oc = out.chunks_exact_mut(LANES);
    let mut ac = a.chunks_exact(LANES);
    let mut bc = b.chunks_exact(LANES);
    for ((o, x), y) in (&mut oc).zip(&mut ac).zip(&mut bc) {
        let mut buf = [0.0f32; LANES];
        for l in 0..LANES {
            buf[l] = f(x[l], y[l]);
        }
        o.copy_from_slice(&buf);
    }
    for ((o, &x), &y) in oc
        .into_remainder()
        .iter_mut()
        .zip(ac.remainder())
        .zip(bc.remainder())
    {
        *o = f(x, y);
    }
}

/// out[i] = f(a[i])
#[inline]
pub fn map(a: &[f32], out: &mut [f32], f: impl Fn(f32) -> f32) {
    let n = out.len().min(a.len());
    let (a, out) = (&a[..n], &mut out[..n]);
    let mut oc = out.chunks_exact_mut(LANES);
    let mut ac = a.chunks_exact(LANES);
    for (o, x) in (&mut oc).zip(&mut ac) {
        let mut buf = [0.0f32; LANES];
        for l in 0..LANES {
            buf[l] = f(x[l]);
        }
        o.copy_from_slice(&buf);
    }
    for (o, &x) in oc.into_remainder().iter_mut().zip(ac.remainder()) {
        *o = f(x);
    }
}

/// a[i] = f(a[i], b[i])
#[inline]
pub fn zip_assign(a: &mut [f32], b: &[f32], f: impl Fn(f32, f32) -> f32) {
    let n = a.len().min(b.len());
    let (a, b) = (&mut a[..n], &b[..n]);
    let mut ac = a.chunks_exact_mut(LANES);
    let mut bc = b.chunks_exact(LANES);
    for (x, y) in (&mut ac).zip(&mut bc) {
        for l in 0..LANES {
            x[l] = f(x[l], y[l]);
        }
    }
    for (x, &y) in ac.into_remainder().iter_mut().zip(bc.remainder()) {
        *x = f(*x, y);
    }
}

/// Σ a[i]·b[i]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            // SAFETY: AVX2 and FMA were detected at runtime.
            return unsafe { dot_avx2(a, b) };
        }
    }
    dot_lanes(a, b)
}

fn dot_lanes(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut acc = [0.0f32; LANES];
    let mut ac = a[..n].chunks_exact(LANES);
    let mut bc = b[..n].chunks_exact(LANES);
    for (x, y) in (&mut ac).zip(&mut bc) {
        for l in 0..LANES {
            acc[l] += x[l] * y[l];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for (x, y) in ac.remainder().iter().zip(bc.remainder()) {
        sum += x * y;
    }
    sum
}

/// y[i] += alpha·x[i]
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2() {
            // SAFETY: AVX2 and FMA were detected at runtime.
            unsafe { axpy_avx2(alpha, x, y) };
            return;
        }
    }
    zip_assign(y, x, |acc, v| acc + alpha * v);
}

/// Σ a[i]
pub fn sum(a: &[f32]) -> f32 {
    let mut acc = [0.0f32; LANES];
    let mut chunks = a.chunks_exact(LANES);
    for c in &mut chunks {
        for l in 0..LANES {
            acc[l] += c[l];
        }
    }
    acc.iter().sum::<f32>() + chunks.remainder().iter().sum::<f32>()
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let n = a.len().min(b.len());
    let chunks = n / 8;
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a_ptr.add(i * 8));
        let vb = _mm256_loadu_ps(b_ptr.add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }
    let low = _mm256_castps256_ps128(acc);
    let high = _mm256_extractf128_ps(acc, 1);
    let sum128 = _mm_add_ps(low, high);
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    let mut result = _mm_cvtss_f32(sum32);
    for i in chunks * 8..n {
        result += *a_ptr.add(i) * *b_ptr.add(i);
    }
    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn axpy_avx2(alpha: f32, x: &[f32], y: &mut [f32]) {
    use std::arch::x86_64::*;

    let n = x.len().min(y.len());
    let chunks = n / 8;
    let x_ptr = x.as_ptr();
    let y_ptr = y.as_mut_ptr();
    let va = _mm256_set1_ps(alpha);
    for i in 0..chunks {
        let vx = _mm256_loadu_ps(x_ptr.add(i * 8));
        let vy = _mm256_loadu_ps(y_ptr.add(i * 8));
        _mm256_storeu_ps(y_ptr.add(i * 8), _mm256_fmadd_ps(va, vx, vy));
    }
    for i in chunks * 8..n {
        *y_ptr.add(i) += alpha * *x_ptr.add(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..37).map(|i| 1.0 - i as f32 * 0.1).collect();
        let expected: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!((dot(&a, &b) - expected).abs() < 1e-3);
        assert!((dot_lanes(&a, &b) - expected).abs() < 1e-3);
    }

    #[test]
    fn axpy_handles_remainder() {
        let x = vec![1.0f32; 11];
        let mut y: Vec<f32> = (0..11).map(|i| i as f32).collect();
        axpy(2.0, &x, &mut y);
        let expected: Vec<f32> = (0..11).map(|i| i as f32 + 2.0).collect();
        assert_eq!(y, expected);
    }

    #[test]
    fn zip_map_and_sum() {
        let a = vec![1.0f32; 19];
        let b = vec![2.0f32; 19];
        let mut out = vec![0.0f32; 19];
        zip_map(&a, &b, &mut out, |x, y| x + y);
        assert_eq!(sum(&out), 57.0);
    }
}
