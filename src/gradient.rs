/*!
Gradients of a factorised objective with respect to one factor at a time.

The line-search updater only needs a gradient vector with the same length as
the (flattened) factor it is optimising. How that vector is obtained is an
injected capability, expressed by the [`Differentiate`] trait:

- [`CentralDifference`] works for any [`FactorObjective`] by perturbing one
  coordinate at a time, optionally in parallel with `rayon`.
- Models can provide exact gradients for some or all factors (see
  [`crate::mixture::MixtureGradient`]).
*/

use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use std::fmt::Debug;

/// An objective to be minimised over a state whose parameters are grouped into
/// independently addressable factors.
pub trait FactorObjective: Sync {
    type State: Clone + Send + Sync;
    type Factor: Copy + Debug + Send + Sync;

    /// Scalar loss at `state` (for variational models, the negative ELBO).
    fn loss(&self, state: &Self::State) -> f64;

    /// The unconstrained values of `factor`, flattened in row-major order.
    fn factor_values(&self, state: &Self::State, factor: Self::Factor) -> Array1<f64>;

    /// Overwrites `factor` with the flattened unconstrained `values`.
    fn set_factor_values(
        &self,
        state: &mut Self::State,
        factor: Self::Factor,
        values: ArrayView1<f64>,
    );
}

/// Gradient of `objective.loss` with respect to a single factor, all other
/// factors held fixed.
pub trait Differentiate<O: FactorObjective> {
    fn gradient(&self, objective: &O, state: &O::State, factor: O::Factor) -> Array1<f64>;
}

/// Numerical gradient by central differences,
/// `(f(x + h e_i) - f(x - h e_i)) / 2h` with `h = rel_step * max(1, |x_i|)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentralDifference {
    pub rel_step: f64,
    pub parallel: bool,
}

impl Default for CentralDifference {
    fn default() -> Self {
        Self {
            rel_step: 1e-6,
            parallel: false,
        }
    }
}

impl CentralDifference {
    /// Evaluates the coordinates in parallel with `rayon`; each worker perturbs its own copy of the state.
    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn partial<O: FactorObjective>(
        &self,
        objective: &O,
        state: &mut O::State,
        factor: O::Factor,
        values: &mut Array1<f64>,
        i: usize,
    ) -> f64 {
        let x = values[i];
        let h = self.rel_step * x.abs().max(1.0);

        values[i] = x + h;
        objective.set_factor_values(state, factor, values.view());
        let plus = objective.loss(state);

        values[i] = x - h;
        objective.set_factor_values(state, factor, values.view());
        let minus = objective.loss(state);

        values[i] = x;
        (plus - minus) / (2.0 * h)
    }
}

impl<O: FactorObjective> Differentiate<O> for CentralDifference {
    fn gradient(&self, objective: &O, state: &O::State, factor: O::Factor) -> Array1<f64> {
        let values = objective.factor_values(state, factor);
        let len = values.len();

        if self.parallel {
            let grads: Vec<f64> = (0..len)
                .into_par_iter()
                .map_init(
                    || (state.clone(), values.clone()),
                    |(scratch, vals), i| self.partial(objective, scratch, factor, vals, i),
                )
                .collect();
            Array1::from(grads)
        } else {
            let mut scratch = state.clone();
            let mut vals = values;
            let grads: Vec<f64> = (0..len)
                .map(|i| self.partial(objective, &mut scratch, factor, &mut vals, i))
                .collect();
            Array1::from(grads)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    /// `f(a, b) = sum (a_i - 1)^2 + 3 * sum b_j^4 + a_0 * b_0`, with `a` and `b` two factors.
    struct Quartic;

    #[derive(Debug, Clone, Copy)]
    enum Part {
        A,
        B,
    }

    impl FactorObjective for Quartic {
        type State = (Array1<f64>, Array1<f64>);
        type Factor = Part;

        fn loss(&self, (a, b): &Self::State) -> f64 {
            a.mapv(|v| (v - 1.0).powi(2)).sum() + 3.0 * b.mapv(|v| v.powi(4)).sum() + a[0] * b[0]
        }

        fn factor_values(&self, state: &Self::State, factor: Part) -> Array1<f64> {
            match factor {
                Part::A => state.0.clone(),
                Part::B => state.1.clone(),
            }
        }

        fn set_factor_values(&self, state: &mut Self::State, factor: Part, values: ArrayView1<f64>) {
            match factor {
                Part::A => state.0.assign(&values),
                Part::B => state.1.assign(&values),
            }
        }
    }

    fn state() -> (Array1<f64>, Array1<f64>) {
        (arr1(&[0.5, -2.0, 3.0]), arr1(&[1.5, -0.25]))
    }

    #[test]
    fn test_central_difference_matches_analytic() {
        let s = state();
        let grad_a = CentralDifference::default().gradient(&Quartic, &s, Part::A);
        let expected_a = arr1(&[2.0 * (0.5 - 1.0) + 1.5, 2.0 * (-3.0), 2.0 * 2.0]);
        assert_abs_diff_eq!(grad_a, expected_a, epsilon = 1e-6);

        let grad_b = CentralDifference::default().gradient(&Quartic, &s, Part::B);
        let expected_b = arr1(&[12.0 * 1.5_f64.powi(3) + 0.5, 12.0 * (-0.25_f64).powi(3)]);
        assert_abs_diff_eq!(grad_b, expected_b, epsilon = 1e-5);
    }

    #[test]
    fn test_parallel_matches_serial_and_leaves_state_untouched() {
        let s = state();
        let serial = CentralDifference::default().gradient(&Quartic, &s, Part::A);
        let parallel = CentralDifference::default()
            .set_parallel(true)
            .gradient(&Quartic, &s, Part::A);
        assert_abs_diff_eq!(serial, parallel, epsilon = 1e-12);
        assert_eq!(s, state());
    }
}
