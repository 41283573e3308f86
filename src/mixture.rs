/*!
CAVI with per-factor line search for a mixture of Gaussians with a shared,
known precision matrix and unknown component means.

Model (`K` components, `D` dimensions):

```text
pi        ~ Dirichlet(alpha0)
mu_k      ~ Normal(m0, (beta0 * Delta0)^-1)
z_n | pi  ~ Categorical(pi)
x_n | z_n ~ Normal(mu_{z_n}, Delta0^-1)
```

Mean-field family:

```text
q(pi)   = Dirichlet(lambda_pi)
q(mu_k) = Normal(lambda_mu_m[k], (lambda_mu_beta[k] * Delta0)^-1)
q(z_n)  = Categorical(phi[n])
```

The optimiser works on unconstrained parameters: `phi = exp_normalize(raw_phi)`
row-wise, `lambda_pi = softplus(raw_lambda_pi)` and
`lambda_mu_beta = softplus(raw_lambda_mu_beta)`. Each sweep runs one
[`BacktrackingLineSearch`] update per factor, in the order
`lambda_pi, phi, lambda_mu_m, lambda_mu_beta`, on the negative ELBO. The
line search step is reset at the start of every run.

# Example

```rust
use mini_cavi::core::{run, RunConfig};
use mini_cavi::data::Observations;
use mini_cavi::line_search::{LineSearchConfig, StepPolicy};
use mini_cavi::mixture::{MixtureCavi, MixturePrior};
use ndarray::arr2;

let centers = arr2(&[[-5.0, -5.0], [5.0, 5.0]]);
let data = Observations::synthetic_mixture(60, centers.view(), 1.0, 7).unwrap();
let mut cavi = MixtureCavi::new(MixturePrior::new(2, 2), &data)
    .unwrap()
    .set_seed(7)
    .set_line_search(LineSearchConfig::default().set_policy(StepPolicy::ResetPerFactor));
let fit = run(&mut cavi, &RunConfig::default().set_max_sweeps(200));
assert!(fit.final_elbo().unwrap().is_finite());
```
*/

use nalgebra as na;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::{Dirichlet, Distribution};
use std::f64::consts::PI;

use crate::core::CoordinateAscent;
use crate::data::Observations;
use crate::error::{positive, CaviError, Result};
use crate::gradient::{CentralDifference, Differentiate, FactorObjective};
use crate::line_search::{BacktrackingLineSearch, LineSearchConfig};
use crate::numerics::{
    column_sums, dirichlet_expectation, exp_normalize_rows, inv_softplus, log_beta, sigmoid,
    softplus, EPS,
};

/// Prior hyperparameters of the mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct MixturePrior {
    /// Dirichlet concentration, one entry per component.
    pub alpha0: Array1<f64>,
    /// Prior mean of every component mean.
    pub m0: Array1<f64>,
    /// Scaling of the prior precision of the component means.
    pub beta0: f64,
    /// Shared observation precision matrix, `D x D` symmetric positive definite.
    pub delta0: Array2<f64>,
}

impl MixturePrior {
    /// `alpha0 = 1`, `m0 = 0`, `beta0 = 0.01` and `Delta0 = I` for `k` components in `d` dimensions.
    pub fn new(k: usize, d: usize) -> Self {
        Self {
            alpha0: Array1::ones(k),
            m0: Array1::zeros(d),
            beta0: 0.01,
            delta0: Array2::eye(d),
        }
    }

    pub fn k(&self) -> usize {
        self.alpha0.len()
    }

    pub fn d(&self) -> usize {
        self.m0.len()
    }

    /// Checks shapes and positivity and returns `ln det Delta0`.
    fn validate(&self) -> Result<f64> {
        let (k, d) = (self.k(), self.d());
        if k == 0 {
            return Err(CaviError::InvalidPrior {
                field: "alpha0",
                reason: "at least one component is required".to_string(),
            });
        }
        for &a in self.alpha0.iter() {
            positive(a, "alpha0")?;
        }
        positive(self.beta0, "beta0")?;
        if self.m0.iter().any(|v| !v.is_finite()) {
            return Err(CaviError::InvalidPrior {
                field: "m0",
                reason: "expected finite entries".to_string(),
            });
        }
        if self.delta0.dim() != (d, d) {
            return Err(CaviError::InvalidPrior {
                field: "delta0",
                reason: format!("expected a {d} x {d} matrix, got {:?}", self.delta0.dim()),
            });
        }
        ln_det_spd(&self.delta0)
    }
}

/// `ln det` of a symmetric positive definite matrix via its Cholesky factor.
fn ln_det_spd(m: &Array2<f64>) -> Result<f64> {
    let d = m.nrows();
    let symmetric = m
        .indexed_iter()
        .all(|((i, j), &v)| (v - m[(j, i)]).abs() <= 1e-12 * v.abs().max(1.0));
    if !symmetric {
        return Err(CaviError::SingularPrecision);
    }
    let dense = na::DMatrix::from_row_iterator(d, d, m.iter().copied());
    let chol = na::Cholesky::new(dense).ok_or(CaviError::SingularPrecision)?;
    Ok(2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>())
}

/// The independently optimised blocks of the variational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MixtureFactor {
    LambdaPi,
    Phi,
    LambdaMuM,
    LambdaMuBeta,
}

impl MixtureFactor {
    /// Order in which one sweep visits the factors.
    pub const SWEEP_ORDER: [MixtureFactor; 4] = [
        MixtureFactor::LambdaPi,
        MixtureFactor::Phi,
        MixtureFactor::LambdaMuM,
        MixtureFactor::LambdaMuBeta,
    ];
}

/// Unconstrained variational parameters. Constrained values are derived on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureState {
    /// `K`, mapped through softplus.
    pub raw_lambda_pi: Array1<f64>,
    /// `N x K` log-weights, mapped through a row-wise exp-normalize.
    pub raw_phi: Array2<f64>,
    /// `K x D` component means (already unconstrained).
    pub lambda_mu_m: Array2<f64>,
    /// `K`, mapped through softplus.
    pub raw_lambda_mu_beta: Array1<f64>,
}

impl MixtureState {
    pub fn lambda_pi(&self) -> Array1<f64> {
        self.raw_lambda_pi.mapv(softplus)
    }

    /// Responsibilities; every row is a probability vector.
    pub fn phi(&self) -> Array2<f64> {
        exp_normalize_rows(self.raw_phi.view())
    }

    pub fn lambda_mu_beta(&self) -> Array1<f64> {
        self.raw_lambda_mu_beta.mapv(softplus)
    }

    /// Most responsible component of every observation.
    pub fn assignments(&self) -> Array1<usize> {
        self.phi()
            .rows()
            .into_iter()
            .map(|row| row.argmax().unwrap_or(0))
            .collect()
    }

    /// Builds the raw state from constrained values.
    pub fn from_constrained(
        lambda_pi: ArrayView1<f64>,
        phi: &Array2<f64>,
        lambda_mu_m: Array2<f64>,
        lambda_mu_beta: ArrayView1<f64>,
    ) -> Self {
        Self {
            raw_lambda_pi: lambda_pi.mapv(inv_softplus),
            raw_phi: phi.mapv(|p| p.max(EPS).ln()),
            lambda_mu_m,
            raw_lambda_mu_beta: lambda_mu_beta.mapv(inv_softplus),
        }
    }

    fn check_shapes(&self, n: usize, k: usize, d: usize) -> Result<()> {
        let shapes_ok = self.raw_lambda_pi.len() == k
            && self.raw_phi.dim() == (n, k)
            && self.lambda_mu_m.dim() == (k, d)
            && self.raw_lambda_mu_beta.len() == k;
        if !shapes_ok {
            return Err(CaviError::InvalidData {
                reason: format!("variational state does not match N={n}, K={k}, D={d}"),
            });
        }
        let finite = self.raw_lambda_pi.iter().all(|v| v.is_finite())
            && self.raw_phi.iter().all(|v| v.is_finite())
            && self.lambda_mu_m.iter().all(|v| v.is_finite())
            && self.raw_lambda_mu_beta.iter().all(|v| v.is_finite());
        if !finite {
            return Err(CaviError::InvalidData {
                reason: "variational state has non-finite entries".to_string(),
            });
        }
        Ok(())
    }
}

/// The mixture model bound to its data: evaluates the ELBO of any [`MixtureState`].
#[derive(Debug, Clone)]
pub struct MixtureModel {
    prior: MixturePrior,
    xn: Array2<f64>,
    ln_det_delta0: f64,
}

impl MixtureModel {
    pub fn new(prior: MixturePrior, data: &Observations) -> Result<Self> {
        let ln_det_delta0 = prior.validate()?;
        if data.d() != prior.d() {
            return Err(CaviError::InvalidData {
                reason: format!("data has D = {}, prior expects D = {}", data.d(), prior.d()),
            });
        }
        Ok(Self {
            prior,
            xn: data.xn().to_owned(),
            ln_det_delta0,
        })
    }

    pub fn prior(&self) -> &MixturePrior {
        &self.prior
    }

    pub fn n(&self) -> usize {
        self.xn.nrows()
    }

    pub fn k(&self) -> usize {
        self.prior.k()
    }

    pub fn d(&self) -> usize {
        self.prior.d()
    }

    /// Heuristic start: Dirichlet responsibilities and the matching conjugate
    /// values of the other factors.
    pub fn initial_state<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<MixtureState> {
        let (n, k) = (self.n(), self.k());
        let mut phi = Array2::<f64>::ones((n, k));
        // A single component leaves nothing to draw.
        if k > 1 {
            let dirichlet = Dirichlet::new(&self.prior.alpha0.to_vec()).map_err(|e| {
                CaviError::InvalidPrior {
                    field: "alpha0",
                    reason: e.to_string(),
                }
            })?;
            for mut row in phi.rows_mut() {
                row.assign(&Array1::from(dirichlet.sample(rng)));
            }
        }

        let nk = column_sums(phi.view());
        let lambda_pi = &self.prior.alpha0 + &nk;
        let lambda_mu_beta = nk.mapv(|c| self.prior.beta0 + c);
        let weighted = phi.t().dot(&self.xn) + &(&self.prior.m0 * self.prior.beta0);
        let lambda_mu_m = weighted / &lambda_mu_beta.view().insert_axis(Axis(1));

        Ok(MixtureState::from_constrained(
            lambda_pi.view(),
            &phi,
            lambda_mu_m,
            lambda_mu_beta.view(),
        ))
    }

    /// Evidence lower bound of `state`.
    ///
    /// The rows of the derived `phi` are probability vectors by construction. The
    /// result is only meaningful for finite raw parameters.
    pub fn elbo(&self, state: &MixtureState) -> f64 {
        let prior = &self.prior;
        let (k, d) = (self.k() as f64, self.d() as f64);
        let lambda_pi = state.lambda_pi();
        let lambda_mu_beta = state.lambda_mu_beta();
        let phi = state.phi();
        let e_ln_pi = dirichlet_expectation(lambda_pi.view());

        // -KL(q(pi) || p(pi))
        let mut lb = log_beta(lambda_pi.view()) - log_beta(prior.alpha0.view())
            + (&prior.alpha0 - &lambda_pi).dot(&e_ln_pi);

        // -KL(q(mu_k) || p(mu_k)), summed over components
        lb += 0.5 * k * (d * prior.beta0.ln() + self.ln_det_delta0) + 0.5 * k * d;
        for (m_k, &beta_k) in state.lambda_mu_m.rows().into_iter().zip(lambda_mu_beta.iter()) {
            let diff = &m_k - &prior.m0;
            let quad = diff.dot(&prior.delta0.dot(&diff));
            lb -= 0.5 * prior.beta0 * quad
                + d * prior.beta0 / (2.0 * beta_k)
                + 0.5 * (d * beta_k.ln() + self.ln_det_delta0);
        }

        // E[ln p(x, z | pi, mu)] + H[q(z)]
        let constant = 0.5 * self.ln_det_delta0 - 0.5 * d * (2.0 * PI).ln();
        for (j, m_k) in state.lambda_mu_m.rows().into_iter().enumerate() {
            let quad = self.mahalanobis(m_k);
            let phi_k = phi.column(j);
            let per_point = quad.mapv(|q| {
                e_ln_pi[j] + constant - 0.5 * q - d / (2.0 * lambda_mu_beta[j])
            }) - phi_k.mapv(f64::ln);
            lb += phi_k.dot(&per_point);
        }

        lb
    }

    /// `(x_n - m)^T Delta0 (x_n - m)` for every observation.
    fn mahalanobis(&self, m: ArrayView1<f64>) -> Array1<f64> {
        let resid = &self.xn - &m;
        (resid.dot(&self.prior.delta0) * &resid).sum_axis(Axis(1))
    }
}

impl FactorObjective for MixtureModel {
    type State = MixtureState;
    type Factor = MixtureFactor;

    fn loss(&self, state: &MixtureState) -> f64 {
        -self.elbo(state)
    }

    fn factor_values(&self, state: &MixtureState, factor: MixtureFactor) -> Array1<f64> {
        match factor {
            MixtureFactor::LambdaPi => state.raw_lambda_pi.clone(),
            MixtureFactor::Phi => state.raw_phi.iter().copied().collect(),
            MixtureFactor::LambdaMuM => state.lambda_mu_m.iter().copied().collect(),
            MixtureFactor::LambdaMuBeta => state.raw_lambda_mu_beta.clone(),
        }
    }

    fn set_factor_values(
        &self,
        state: &mut MixtureState,
        factor: MixtureFactor,
        values: ArrayView1<f64>,
    ) {
        match factor {
            MixtureFactor::LambdaPi => state.raw_lambda_pi.assign(&values),
            MixtureFactor::Phi => state
                .raw_phi
                .iter_mut()
                .zip(values.iter())
                .for_each(|(dst, &v)| *dst = v),
            MixtureFactor::LambdaMuM => state
                .lambda_mu_m
                .iter_mut()
                .zip(values.iter())
                .for_each(|(dst, &v)| *dst = v),
            MixtureFactor::LambdaMuBeta => state.raw_lambda_mu_beta.assign(&values),
        }
    }
}

/// Gradient of the negative mixture ELBO.
///
/// Exact for `phi`, `lambda_mu_m` and `lambda_mu_beta`. The `lambda_pi` block
/// involves polygamma functions and is differentiated numerically; it only has
/// `K` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MixtureGradient {
    pub numeric: CentralDifference,
}

impl Differentiate<MixtureModel> for MixtureGradient {
    fn gradient(
        &self,
        model: &MixtureModel,
        state: &MixtureState,
        factor: MixtureFactor,
    ) -> Array1<f64> {
        let prior = &model.prior;
        let d = model.d() as f64;
        match factor {
            MixtureFactor::LambdaPi => self.numeric.gradient(model, state, factor),
            MixtureFactor::Phi => {
                let phi = state.phi();
                let lambda_mu_beta = state.lambda_mu_beta();
                let e_ln_pi = dirichlet_expectation(state.lambda_pi().view());
                let constant = 0.5 * model.ln_det_delta0 - 0.5 * d * (2.0 * PI).ln() - 1.0;

                // dELBO/dphi_nk
                let mut g = Array2::<f64>::zeros(phi.raw_dim());
                for (j, m_k) in state.lambda_mu_m.rows().into_iter().enumerate() {
                    let offset = e_ln_pi[j] + constant - d / (2.0 * lambda_mu_beta[j]);
                    let quad = model.mahalanobis(m_k);
                    g.column_mut(j).assign(
                        &(quad.mapv(|q| offset - 0.5 * q) - phi.column(j).mapv(f64::ln)),
                    );
                }

                // Chain rule through the exp-normalize of each row.
                let mut out = Array2::<f64>::zeros(phi.raw_dim());
                for ((mut dst, raw), (p, gn)) in out
                    .rows_mut()
                    .into_iter()
                    .zip(state.raw_phi.rows())
                    .zip(phi.rows().into_iter().zip(g.rows()))
                {
                    let max = raw.fold(f64::NEG_INFINITY, |acc, &r| acc.max(r));
                    let e = raw.mapv(|r| (r - max).exp());
                    let total = e.sum() + EPS * e.len() as f64;
                    let mean_g = p.dot(&gn);
                    dst.assign(&(-(&e / total) * &gn.mapv(|v| v - mean_g)));
                }
                out.iter().copied().collect()
            }
            MixtureFactor::LambdaMuM => {
                let phi = state.phi();
                let nk = column_sums(phi.view());
                let weighted = phi.t().dot(&model.xn);
                let mut out = Array2::<f64>::zeros(state.lambda_mu_m.raw_dim());
                for (j, (mut dst, m_k)) in out
                    .rows_mut()
                    .into_iter()
                    .zip(state.lambda_mu_m.rows())
                    .enumerate()
                {
                    let pull = &weighted.row(j) - &(&m_k * nk[j]) - &((&m_k - &prior.m0) * prior.beta0);
                    dst.assign(&(-prior.delta0.dot(&pull)));
                }
                out.iter().copied().collect()
            }
            MixtureFactor::LambdaMuBeta => {
                let nk = column_sums(state.phi().view());
                let beta = state.lambda_mu_beta();
                let mut out = Array1::<f64>::zeros(beta.len());
                for (j, dst) in out.iter_mut().enumerate() {
                    let b = beta[j];
                    let dlb = d * (prior.beta0 + nk[j]) / (2.0 * b * b) - d / (2.0 * b);
                    *dst = -dlb * sigmoid(state.raw_lambda_mu_beta[j]);
                }
                out
            }
        }
    }
}

/// Mixture model, its variational state and the line search driving the sweeps.
///
/// `G` supplies the per-factor gradients; the default is the exact
/// [`MixtureGradient`], any [`Differentiate`] implementation (e.g.
/// [`CentralDifference`]) can be swapped in with
/// [`with_differentiator`](Self::with_differentiator).
#[derive(Debug, Clone)]
pub struct MixtureCavi<G = MixtureGradient> {
    model: MixtureModel,
    state: MixtureState,
    line_search: BacktrackingLineSearch,
    differentiator: G,
}

impl MixtureCavi<MixtureGradient> {
    /// Validates the prior against the data and draws the heuristic initial
    /// state from an entropy-seeded RNG. Use [`set_seed`](Self::set_seed) for reproducible runs.
    pub fn new(prior: MixturePrior, data: &Observations) -> Result<Self> {
        let model = MixtureModel::new(prior, data)?;
        let mut rng = SmallRng::seed_from_u64(thread_rng().gen::<u64>());
        let state = model.initial_state(&mut rng)?;
        Ok(Self {
            model,
            state,
            line_search: BacktrackingLineSearch::default(),
            differentiator: MixtureGradient::default(),
        })
    }
}

impl<G> MixtureCavi<G> {
    /// Re-draws the initial state from a seeded RNG.
    pub fn set_seed(mut self, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        if let Ok(state) = self.model.initial_state(&mut rng) {
            self.state = state;
        }
        self
    }

    /// Replaces the line search, resetting its step size.
    pub fn set_line_search(mut self, config: LineSearchConfig) -> Self {
        self.line_search = BacktrackingLineSearch::new(config);
        self
    }

    pub fn with_differentiator<H>(self, differentiator: H) -> MixtureCavi<H> {
        MixtureCavi {
            model: self.model,
            state: self.state,
            line_search: self.line_search,
            differentiator,
        }
    }

    /// Replaces the variational state after checking its shapes.
    pub fn set_state(&mut self, state: MixtureState) -> Result<()> {
        state.check_shapes(self.model.n(), self.model.k(), self.model.d())?;
        self.state = state;
        Ok(())
    }

    pub fn state(&self) -> &MixtureState {
        &self.state
    }

    pub fn model(&self) -> &MixtureModel {
        &self.model
    }

    pub fn line_search(&self) -> &BacktrackingLineSearch {
        &self.line_search
    }
}

impl<G: Differentiate<MixtureModel>> CoordinateAscent for MixtureCavi<G> {
    fn sweep(&mut self) {
        for factor in MixtureFactor::SWEEP_ORDER {
            self.line_search
                .update(&self.model, &self.differentiator, &mut self.state, factor);
        }
    }

    fn elbo(&self) -> f64 {
        self.model.elbo(&self.state)
    }

    /// A new run starts the carried step from `initial_step` again.
    fn begin_run(&mut self) {
        self.line_search.reset();
    }

    fn summary(&self) -> String {
        format!(
            "Mus={:.4} Precision={:.4} Pi={:.4}",
            self.state.lambda_mu_m,
            self.state.lambda_mu_beta(),
            self.state.lambda_pi()
        )
    }
}
