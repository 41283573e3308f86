/*!
Numerically careful building blocks shared by the ELBO evaluators.

Positive parameters are stored unconstrained and mapped through [`softplus`];
responsibilities are stored as unnormalized log-weights and mapped through
[`exp_normalize`]. All exponentials subtract the maximum first, and every
normalizer carries [`EPS`] so it never divides by zero.

# Examples

```rust
use mini_cavi::numerics::{exp_normalize, inv_softplus, softplus};
use ndarray::arr1;

let p = exp_normalize(arr1(&[1.0, 2.0, 3.0]).view());
assert!((p.sum() - 1.0).abs() < 1e-12);

let y = softplus(inv_softplus(4.2_f64));
assert!((y - 4.2).abs() < 1e-12);
```
*/

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::Float;
use special::Gamma;

/// Small positive constant guarding logs, log-gammas and normalizers.
pub const EPS: f64 = 1e-7;

/// Smooth positivity map `ln(1 + e^x)`, stable for large `|x|`.
pub fn softplus<T: Float>(x: T) -> T {
    x.max(T::zero()) + (-x.abs()).exp().ln_1p()
}

/// Inverse of [`softplus`] for `y > 0`.
pub fn inv_softplus<T: Float>(y: T) -> T {
    y + (-(-y).exp_m1()).ln()
}

/// Logistic function, the derivative of [`softplus`].
pub fn sigmoid<T: Float>(x: T) -> T {
    if x >= T::zero() {
        T::one() / (T::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (T::one() + e)
    }
}

/// Natural log of the gamma function.
pub fn ln_gamma(x: f64) -> f64 {
    Gamma::ln_gamma(x).0
}

pub fn digamma(x: f64) -> f64 {
    Gamma::digamma(x)
}

/// Maps unnormalized log-weights to a probability vector.
///
/// Computes `(exp(r_i - max r) + EPS) / sum_j (exp(r_j - max r) + EPS)`, so every
/// entry lies strictly inside `(0, 1)` and the entries sum to one.
pub fn exp_normalize(raw: ArrayView1<f64>) -> Array1<f64> {
    let max = raw.fold(f64::NEG_INFINITY, |acc, &r| acc.max(r));
    let shifted = raw.mapv(|r| (r - max).exp() + EPS);
    let total = shifted.sum();
    shifted / total
}

/// Row-wise [`exp_normalize`] of an `N x K` matrix.
pub fn exp_normalize_rows(raw: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros(raw.raw_dim());
    Zip::from(out.rows_mut())
        .and(raw.rows())
        .for_each(|mut dst, src| dst.assign(&exp_normalize(src)));
    out
}

/// Log of the multivariate beta function, `sum lnΓ(x_i + EPS) - lnΓ(sum (x_i + EPS))`.
pub fn log_beta(x: ArrayView1<f64>) -> f64 {
    let shifted = x.mapv(|v| v + EPS);
    shifted.iter().map(|&v| ln_gamma(v)).sum::<f64>() - ln_gamma(shifted.sum())
}

/// `E[ln pi_k]` under `Dirichlet(alpha)`, i.e. `ψ(alpha_k + EPS) - ψ(sum_j (alpha_j + EPS))`.
pub fn dirichlet_expectation(alpha: ArrayView1<f64>) -> Array1<f64> {
    let total = digamma(alpha.sum() + EPS * alpha.len() as f64);
    alpha.mapv(|a| digamma(a + EPS) - total)
}

/// Sum of each column, i.e. the expected component counts of a responsibility matrix.
pub fn column_sums(phi: ArrayView2<f64>) -> Array1<f64> {
    phi.sum_axis(Axis(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_softplus_roundtrip_and_limits() {
        for &y in &[1e-8_f64, 1e-3, 0.5, 1.0, 7.0, 60.0, 1e4] {
            assert_abs_diff_eq!(softplus(inv_softplus(y)), y, epsilon = 1e-9 * y.max(1.0));
        }
        assert_abs_diff_eq!(softplus(0.0_f64), 2.0_f64.ln(), epsilon = 1e-15);
        assert_eq!(softplus(1000.0_f64), 1000.0);
        assert!(softplus(-1000.0_f64) >= 0.0);
        assert!(softplus(-30.0_f64) > 0.0);
    }

    #[test]
    fn test_sigmoid_is_softplus_derivative() {
        let h = 1e-6;
        for &x in &[-20.0_f64, -1.0, 0.0, 0.3, 5.0] {
            let fd = (softplus(x + h) - softplus(x - h)) / (2.0 * h);
            assert_abs_diff_eq!(sigmoid(x), fd, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_exp_normalize_extreme_inputs() {
        let p = exp_normalize(arr1(&[1000.0, -1000.0, 0.0]).view());
        assert!(p.iter().all(|v| v.is_finite() && *v > 0.0 && *v < 1.0));
        assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
        assert!(p[0] > 0.999);
    }

    #[test]
    fn test_exp_normalize_rows_are_distributions() {
        let mut rng = SmallRng::seed_from_u64(7);
        let raw = Array2::from_shape_fn((50, 4), |_| rng.gen_range(-500.0..500.0));
        let phi = exp_normalize_rows(raw.view());
        for row in phi.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
            assert!(row.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_log_beta_matches_beta_function() {
        // B(2, 3) = 1/12
        assert_abs_diff_eq!(log_beta(arr1(&[2.0, 3.0]).view()), (1.0_f64 / 12.0).ln(), epsilon = 1e-6);
        // Finite even at zero.
        assert!(log_beta(arr1(&[0.0, 1.0]).view()).is_finite());
    }

    #[test]
    fn test_dirichlet_expectation_symmetric() {
        let e = dirichlet_expectation(arr1(&[1.0, 1.0]).view());
        // ψ(1) - ψ(2) = -1
        assert_abs_diff_eq!(e[0], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(e[0], e[1], epsilon = 1e-15);
    }

    #[test]
    fn test_column_sums() {
        let phi = arr2(&[[0.2, 0.8], [0.5, 0.5]]);
        assert_abs_diff_eq!(column_sums(phi.view()), arr1(&[0.7, 1.3]), epsilon = 1e-12);
    }
}
