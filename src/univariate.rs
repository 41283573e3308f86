/*!
Closed-form CAVI for a univariate Gaussian with unknown mean and precision.

Model:

```text
x_n | mu, tau ~ Normal(mu, 1/tau)
mu            ~ Normal(m0, 1/beta0)
tau           ~ Gamma(a0, b0)            (shape, rate)
```

Mean-field family `q(mu) q(tau)` with `q(mu) = Normal(m_mu, 1/beta_mu)` and
`q(tau) = Gamma(a_gamma, b_gamma)`. Conjugacy gives exact coordinate updates,
so the ELBO never decreases from one sweep to the next.
*/

use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal};
use std::f64::consts::PI;

use crate::core::CoordinateAscent;
use crate::data::Observations;
use crate::error::{positive, CaviError, Result};
use crate::numerics::{digamma, ln_gamma};

/// Normal-Gamma prior hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnivariatePrior {
    pub m0: f64,
    pub beta0: f64,
    pub a0: f64,
    pub b0: f64,
}

impl Default for UnivariatePrior {
    fn default() -> Self {
        Self {
            m0: 0.0,
            beta0: 1e-4,
            a0: 1e-3,
            b0: 1e-3,
        }
    }
}

impl UnivariatePrior {
    pub fn validate(&self) -> Result<()> {
        if !self.m0.is_finite() {
            return Err(CaviError::InvalidPrior {
                field: "m0",
                reason: format!("expected a finite value, got {}", self.m0),
            });
        }
        positive(self.beta0, "beta0")?;
        positive(self.a0, "a0")?;
        positive(self.b0, "b0")?;
        Ok(())
    }
}

/// Variational parameters of `q(mu) q(tau)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnivariateState {
    pub m_mu: f64,
    pub beta_mu: f64,
    pub a_gamma: f64,
    pub b_gamma: f64,
}

impl UnivariateState {
    /// `E[tau]`, the posterior precision estimate.
    pub fn expected_precision(&self) -> f64 {
        self.a_gamma / self.b_gamma
    }

    fn validate(&self) -> Result<()> {
        if !self.m_mu.is_finite() {
            return Err(CaviError::InvalidPrior {
                field: "m_mu",
                reason: format!("expected a finite value, got {}", self.m_mu),
            });
        }
        positive(self.beta_mu, "beta_mu")?;
        positive(self.a_gamma, "a_gamma")?;
        positive(self.b_gamma, "b_gamma")?;
        Ok(())
    }
}

/// The data reductions the univariate model needs: `N`, `sum x_n` and `sum x_n^2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianStats {
    pub n: f64,
    pub sum_x: f64,
    pub sum_x2: f64,
}

impl GaussianStats {
    pub fn from_observations(data: &Observations) -> Result<Self> {
        if data.d() != 1 {
            return Err(CaviError::InvalidData {
                reason: format!("univariate model needs D = 1, got D = {}", data.d()),
            });
        }
        let x = data.column(0);
        Ok(Self {
            n: x.len() as f64,
            sum_x: x.sum(),
            sum_x2: x.dot(&x),
        })
    }
}

/// Evidence lower bound of `state` under `prior` for data summarised by `stats`.
///
/// Requires `beta_mu`, `a_gamma` and `b_gamma` to be positive; otherwise the
/// result is NaN or infinite.
pub fn elbo(prior: &UnivariatePrior, state: &UnivariateState, stats: &GaussianStats) -> f64 {
    let UnivariatePrior { m0, beta0, a0, b0 } = *prior;
    let UnivariateState {
        m_mu,
        beta_mu,
        a_gamma,
        b_gamma,
    } = *state;
    let GaussianStats { n, sum_x, sum_x2 } = *stats;

    let e_tau = a_gamma / b_gamma;
    let e_ln_tau = digamma(a_gamma) - b_gamma.ln();
    let e_mu2 = m_mu * m_mu + 1.0 / beta_mu;

    // -KL(q(mu) || p(mu))
    let kl_mu = 0.5 * (beta0 / beta_mu).ln() + 0.5 * e_mu2 * (beta_mu - beta0)
        - m_mu * (beta_mu * m_mu - beta0 * m0)
        + 0.5 * (beta_mu * m_mu * m_mu - beta0 * m0 * m0);

    // -KL(q(tau) || p(tau))
    let kl_tau = a0 * b0.ln() - a_gamma * b_gamma.ln() + ln_gamma(a_gamma) - ln_gamma(a0)
        + e_ln_tau * (a0 - a_gamma)
        + e_tau * (b_gamma - b0);

    // E[ln p(x | mu, tau)]
    let likelihood = 0.5 * n * e_ln_tau - 0.5 * n * (2.0 * PI).ln() - 0.5 * e_tau * sum_x2
        + e_tau * sum_x * m_mu
        - 0.5 * n * e_tau * e_mu2;

    kl_mu + kl_tau + likelihood
}

/// One closed-form coordinate ascent sweep.
///
/// `q(mu)` is updated first from the previous `E[tau]`, then `q(tau)` from the
/// new `q(mu)`.
pub fn sweep(prior: &UnivariatePrior, state: &mut UnivariateState, stats: &GaussianStats) {
    let e_tau = state.expected_precision();

    state.beta_mu = prior.beta0 + stats.n * e_tau;
    state.m_mu = (prior.beta0 * prior.m0 + e_tau * stats.sum_x) / state.beta_mu;

    state.a_gamma = prior.a0 + stats.n / 2.0;
    state.b_gamma = prior.b0 + 0.5 * stats.sum_x2 - state.m_mu * stats.sum_x
        + stats.n / 2.0 * (state.m_mu * state.m_mu + 1.0 / state.beta_mu);
}

/// Random initialisation: `a, b ~ Gamma(1, 1)`, `m_mu ~ Normal(0, 1/beta0)`,
/// `beta_mu ~ Gamma(shape = a, scale = b)`.
pub fn random_state<R: Rng + ?Sized>(prior: &UnivariatePrior, rng: &mut R) -> Result<UnivariateState> {
    let unit_gamma = Gamma::<f64>::new(1.0, 1.0).map_err(|e| CaviError::InvalidPrior {
        field: "a_gamma",
        reason: e.to_string(),
    })?;
    let a_gamma = unit_gamma.sample(rng).max(f64::MIN_POSITIVE);
    let b_gamma = unit_gamma.sample(rng).max(f64::MIN_POSITIVE);
    let m_mu = Normal::new(0.0, 1.0 / prior.beta0)
        .map_err(|e| CaviError::InvalidPrior {
            field: "beta0",
            reason: e.to_string(),
        })?
        .sample(rng);
    let beta_mu = Gamma::new(a_gamma, b_gamma)
        .map_err(|e| CaviError::InvalidPrior {
            field: "beta_mu",
            reason: e.to_string(),
        })?
        .sample(rng)
        .max(f64::MIN_POSITIVE);
    Ok(UnivariateState {
        m_mu,
        beta_mu,
        a_gamma,
        b_gamma,
    })
}

/// Univariate Gaussian model bound to its data, optimised with closed-form CAVI.
#[derive(Debug, Clone)]
pub struct UnivariateGaussian {
    prior: UnivariatePrior,
    stats: GaussianStats,
    state: UnivariateState,
}

impl UnivariateGaussian {
    /// Validates the prior and data and draws a random initial state from an
    /// entropy-seeded RNG. Use [`set_seed`](Self::set_seed) for reproducible runs.
    pub fn new(prior: UnivariatePrior, data: &Observations) -> Result<Self> {
        prior.validate()?;
        let stats = GaussianStats::from_observations(data)?;
        let mut rng = SmallRng::seed_from_u64(thread_rng().gen::<u64>());
        let state = random_state(&prior, &mut rng)?;
        Ok(Self {
            prior,
            stats,
            state,
        })
    }

    /// Re-draws the initial state from a seeded RNG.
    pub fn set_seed(mut self, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        if let Ok(state) = random_state(&self.prior, &mut rng) {
            self.state = state;
        }
        self
    }

    /// Replaces the current state; every scale parameter must be positive.
    pub fn set_state(&mut self, state: UnivariateState) -> Result<()> {
        state.validate()?;
        self.state = state;
        Ok(())
    }

    pub fn state(&self) -> &UnivariateState {
        &self.state
    }

    pub fn prior(&self) -> &UnivariatePrior {
        &self.prior
    }

    pub fn stats(&self) -> &GaussianStats {
        &self.stats
    }
}

impl CoordinateAscent for UnivariateGaussian {
    fn sweep(&mut self) {
        sweep(&self.prior, &mut self.state, &self.stats);
    }

    fn elbo(&self) -> f64 {
        elbo(&self.prior, &self.state, &self.stats)
    }

    fn summary(&self) -> String {
        format!(
            "Mu={} Precision={}",
            self.state.m_mu,
            self.state.expected_precision()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{run, RunConfig};
    use approx::assert_abs_diff_eq;

    fn data() -> Observations {
        Observations::synthetic_univariate(100, 7.0, 1).unwrap()
    }

    #[test]
    fn test_sweep_formulas() {
        let prior = UnivariatePrior::default();
        let stats = GaussianStats {
            n: 4.0,
            sum_x: 8.0,
            sum_x2: 20.0,
        };
        let mut state = UnivariateState {
            m_mu: 100.0,
            beta_mu: 3.0,
            a_gamma: 2.0,
            b_gamma: 4.0,
        };
        sweep(&prior, &mut state, &stats);

        let beta_mu = 1e-4 + 4.0 * 0.5;
        let m_mu = 0.5 * 8.0 / beta_mu;
        assert_abs_diff_eq!(state.beta_mu, beta_mu, epsilon = 1e-12);
        assert_abs_diff_eq!(state.m_mu, m_mu, epsilon = 1e-12);
        assert_abs_diff_eq!(state.a_gamma, 1e-3 + 2.0, epsilon = 1e-12);
        let b = 1e-3 + 10.0 - m_mu * 8.0 + 2.0 * (m_mu * m_mu + 1.0 / beta_mu);
        assert_abs_diff_eq!(state.b_gamma, b, epsilon = 1e-12);
    }

    #[test]
    fn test_elbo_is_finite_for_valid_state() {
        let model = UnivariateGaussian::new(UnivariatePrior::default(), &data())
            .unwrap()
            .set_seed(5);
        assert!(model.elbo().is_finite());
    }

    #[test]
    fn test_elbo_non_finite_for_invalid_state() {
        let stats = GaussianStats::from_observations(&data()).unwrap();
        let state = UnivariateState {
            m_mu: 0.0,
            beta_mu: 0.0,
            a_gamma: 1.0,
            b_gamma: 1.0,
        };
        assert!(!elbo(&UnivariatePrior::default(), &state, &stats).is_finite());
    }

    #[test]
    fn test_elbo_non_decreasing_from_random_starts() {
        let mut rng = SmallRng::seed_from_u64(2024);
        for _ in 0..200 {
            let n = rng.gen_range(1..300);
            let mean = rng.gen_range(-20.0..20.0);
            let data = Observations::synthetic_univariate(n, mean, rng.gen()).unwrap();
            let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data).unwrap();
            model
                .set_state(UnivariateState {
                    m_mu: rng.gen_range(-50.0..50.0),
                    beta_mu: rng.gen_range(1e-3..10.0),
                    a_gamma: rng.gen_range(1e-3..10.0),
                    b_gamma: rng.gen_range(1e-3..10.0),
                })
                .unwrap();

            let mut previous = model.elbo();
            for _ in 0..10 {
                model.sweep();
                let current = model.elbo();
                assert!(
                    current >= previous - 1e-9 * previous.abs().max(1.0),
                    "ELBO decreased from {previous} to {current} (n={n})"
                );
                previous = current;
            }
        }
    }

    #[test]
    fn test_random_state_is_valid_and_reproducible() {
        let prior = UnivariatePrior::default();
        for seed in 0..100 {
            let a = random_state(&prior, &mut SmallRng::seed_from_u64(seed)).unwrap();
            let b = random_state(&prior, &mut SmallRng::seed_from_u64(seed)).unwrap();
            assert_eq!(a, b);
            assert!(a.validate().is_ok(), "seed {seed}: {a:?}");
        }
    }

    #[test]
    fn test_fit_recovers_mean_and_precision() {
        let data = data();
        let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data)
            .unwrap()
            .set_seed(42);
        let fit = run(&mut model, &RunConfig::default());
        assert!(fit.converged);
        assert!((model.state().m_mu - 7.0).abs() < 0.5);
        let precision = model.state().expected_precision();
        assert!((0.5..=2.0).contains(&precision), "precision = {precision}");
    }

    #[test]
    fn test_rejects_invalid_prior_and_data() {
        let bad = UnivariatePrior {
            beta0: 0.0,
            ..UnivariatePrior::default()
        };
        assert!(UnivariateGaussian::new(bad, &data()).is_err());

        let two_d = Observations::new(ndarray::Array2::zeros((3, 2)), None).unwrap();
        assert!(UnivariateGaussian::new(UnivariatePrior::default(), &two_d).is_err());
    }

    #[test]
    fn test_set_state_rejects_non_positive_scales() {
        let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data()).unwrap();
        let bad = UnivariateState {
            m_mu: 0.0,
            beta_mu: 1.0,
            a_gamma: -1.0,
            b_gamma: 1.0,
        };
        assert!(model.set_state(bad).is_err());
    }
}
