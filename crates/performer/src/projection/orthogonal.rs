//! Haar-distributed orthogonal blocks.
//!
//! A block is drawn by taking a square matrix of standard normal entries,
//! factoring it with Householder QR in `f64`, fixing the column signs of `Q`
//! against `diag(R)` and returning `Qᵗ`. The sign fix makes the draw uniform
//! over the orthogonal group rather than biased by the reflection convention.

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::core::AttentionError;

/// Relative pivot size below which a column counts as linearly dependent.
const RANK_TOLERANCE: f64 = 1e-10;

/// Draws one `size x size` orthogonal matrix, row-major, in `f64`.
pub fn sample_orthogonal_block<R: Rng + ?Sized>(
    size: usize,
    rng: &mut R,
) -> Result<Vec<f64>, AttentionError> {
    if size == 0 {
        return Err(AttentionError::Decomposition {
            size,
            reason: "block size must be greater than zero".to_string(),
        });
    }
    let gaussian: Vec<f64> = (0..size * size)
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect();
    orthogonal_factor_transposed(&gaussian, size)
}

/// Same as [`sample_orthogonal_block`] but returned as a tensor cast to `dtype`.
pub fn orthogonal_block<R: Rng + ?Sized>(
    size: usize,
    rng: &mut R,
    device: &Device,
    dtype: DType,
) -> Result<Tensor, AttentionError> {
    let block = sample_orthogonal_block(size, rng)?;
    let tensor = Tensor::from_vec(block, (size, size), device)?;
    Ok(tensor.to_dtype(dtype)?)
}

/// Returns `Qᵗ` for `a = QR`, with `Q` sign-corrected so `diag(R) > 0`.
pub(crate) fn orthogonal_factor_transposed(a: &[f64], n: usize) -> Result<Vec<f64>, AttentionError> {
    let (mut q, r) = householder_qr(a, n)?;
    for col in 0..n {
        if r[col * n + col] < 0.0 {
            for row in 0..n {
                q[row * n + col] = -q[row * n + col];
            }
        }
    }
    let mut transposed = vec![0.0; n * n];
    for row in 0..n {
        for col in 0..n {
            transposed[col * n + row] = q[row * n + col];
        }
    }
    Ok(transposed)
}

fn householder_qr(a: &[f64], n: usize) -> Result<(Vec<f64>, Vec<f64>), AttentionError> {
    if a.len() != n * n {
        return Err(AttentionError::Decomposition {
            size: n,
            reason: format!("expected {} entries, got {}", n * n, a.len()),
        });
    }
    if a.iter().any(|value| !value.is_finite()) {
        return Err(AttentionError::Decomposition {
            size: n,
            reason: "input contains non-finite entries".to_string(),
        });
    }

    let scale = a.iter().fold(0.0f64, |acc, value| acc.max(value.abs()));
    let mut r = a.to_vec();
    let mut q = vec![0.0; n * n];
    for i in 0..n {
        q[i * n + i] = 1.0;
    }

    let mut v = vec![0.0; n];
    for k in 0..n {
        let norm = (k..n).map(|i| r[i * n + k].powi(2)).sum::<f64>().sqrt();
        if norm <= RANK_TOLERANCE * scale || norm == 0.0 {
            return Err(AttentionError::Decomposition {
                size: n,
                reason: format!("column {k} is numerically dependent"),
            });
        }
        let alpha = if r[k * n + k] >= 0.0 { -norm } else { norm };

        let len = n - k;
        for i in 0..len {
            v[i] = r[(k + i) * n + k];
        }
        v[0] -= alpha;
        let v_norm = v[..len].iter().map(|x| x * x).sum::<f64>().sqrt();
        for x in v[..len].iter_mut() {
            *x /= v_norm;
        }

        // R <- H R
        for col in 0..n {
            let dot: f64 = (0..len).map(|i| v[i] * r[(k + i) * n + col]).sum();
            for i in 0..len {
                r[(k + i) * n + col] -= 2.0 * v[i] * dot;
            }
        }
        // Q <- Q H
        for row in 0..n {
            let dot: f64 = (0..len).map(|i| q[row * n + k + i] * v[i]).sum();
            for i in 0..len {
                q[row * n + k + i] -= 2.0 * dot * v[i];
            }
        }
    }

    Ok((q, r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn gram_deviation(m: &[f64], n: usize) -> f64 {
        let mut worst = 0.0f64;
        for i in 0..n {
            for j in 0..n {
                let dot: f64 = (0..n).map(|k| m[k * n + i] * m[k * n + j]).sum();
                let target = if i == j { 1.0 } else { 0.0 };
                worst = worst.max((dot - target).abs());
            }
        }
        worst
    }

    #[test]
    fn blocks_are_orthogonal() {
        let mut rng = StdRng::seed_from_u64(3);
        for size in [1usize, 2, 7, 16, 64] {
            let block = sample_orthogonal_block(size, &mut rng).unwrap();
            assert!(gram_deviation(&block, size) < 1e-10, "size {size}");
        }
    }

    #[test]
    fn tensor_block_is_orthogonal_in_f32() -> Result<(), AttentionError> {
        let mut rng = StdRng::seed_from_u64(11);
        let block = orthogonal_block(32, &mut rng, &Device::Cpu, DType::F32)?;
        assert_eq!(block.dtype(), DType::F32);
        let gram = block.t()?.matmul(&block)?;
        let identity = Tensor::eye(32, DType::F32, &Device::Cpu)?;
        let worst = gram.sub(&identity)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(worst < 1e-4, "worst deviation {worst}");
        Ok(())
    }

    #[test]
    fn factor_reconstructs_input() {
        let n = 5;
        let mut rng = StdRng::seed_from_u64(19);
        let a: Vec<f64> = (0..n * n).map(|_| rng.sample(StandardNormal)).collect();
        let (q, r) = householder_qr(&a, n).unwrap();
        for i in 0..n {
            for j in 0..n {
                let value: f64 = (0..n).map(|k| q[i * n + k] * r[k * n + j]).sum();
                assert!((value - a[i * n + j]).abs() < 1e-10);
            }
            for j in 0..i {
                assert!(r[i * n + j].abs() < 1e-10, "R must be upper triangular");
            }
        }
    }

    #[test]
    fn sign_fix_makes_r_diagonal_positive() {
        // With the sign fix, Qᵗ a must have a positive diagonal.
        let n = 4;
        let mut rng = StdRng::seed_from_u64(5);
        let a: Vec<f64> = (0..n * n).map(|_| rng.sample(StandardNormal)).collect();
        let qt = orthogonal_factor_transposed(&a, n).unwrap();
        for k in 0..n {
            let diag: f64 = (0..n).map(|i| qt[k * n + i] * a[i * n + k]).sum();
            assert!(diag > 0.0);
        }
    }

    #[test]
    fn singular_input_is_fatal() {
        let err = orthogonal_factor_transposed(&[1.0, 2.0, 2.0, 4.0], 2).unwrap_err();
        assert!(matches!(err, AttentionError::Decomposition { size: 2, .. }));

        let err = orthogonal_factor_transposed(&[0.0; 9], 3).unwrap_err();
        assert!(matches!(err, AttentionError::Decomposition { .. }));

        let err = orthogonal_factor_transposed(&[f64::NAN, 0.0, 0.0, 1.0], 2).unwrap_err();
        assert!(matches!(err, AttentionError::Decomposition { .. }));
    }

    #[test]
    fn same_seed_same_block() {
        let a = sample_orthogonal_block(8, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = sample_orthogonal_block(8, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }
}
