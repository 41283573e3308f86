/*!
Backtracking line search applied to one factor of a [`FactorObjective`] at a time.

Each update:

1. computes the gradient `g` of the loss with respect to the factor, all other
   factors fixed;
2. tries `x - step * g`; while the loss there is NaN or infinite, shrinks the
   step by `nonfinite_shrink`;
3. shrinks the step by `tau` until the Armijo condition
   `f(x - step * g) < f(x) - step * c * ||g||^2` holds;
4. commits the new factor value.

If the step drops below `min_step` in either loop it is forced to zero and the
factor is left unchanged for this sweep.

With [`StepPolicy::Carried`] the step size is initialised at the start of a
run (see [`BacktrackingLineSearch::reset`]) and every search starts from
wherever the previous one ended, across factors and sweeps. Since the step
never grows again within a run, it can only decay.
*/

use log::debug;
use ndarray::{Array1, ArrayView1};

use crate::gradient::{Differentiate, FactorObjective};

/// How the step size is initialised before each factor update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPolicy {
    /// Start from the step the previous search ended with.
    #[default]
    Carried,
    /// Start every search from `initial_step`.
    ResetPerFactor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSearchConfig {
    pub initial_step: f64,
    /// Armijo sufficient-decrease constant.
    pub c: f64,
    /// Backtracking factor.
    pub tau: f64,
    /// Shrink factor used while the loss is not finite.
    pub nonfinite_shrink: f64,
    /// Steps below this are treated as zero.
    pub min_step: f64,
    pub policy: StepPolicy,
}

impl Default for LineSearchConfig {
    fn default() -> Self {
        Self {
            initial_step: 1e10,
            c: 0.5,
            tau: 0.2,
            nonfinite_shrink: 0.1,
            min_step: 1e-10,
            policy: StepPolicy::Carried,
        }
    }
}

impl LineSearchConfig {
    pub fn set_policy(mut self, policy: StepPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_initial_step(mut self, initial_step: f64) -> Self {
        self.initial_step = initial_step;
        self
    }
}

/// What happened during one factor update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSearchOutcome {
    /// Step size used for the committed update, or 0 if the factor was left unchanged.
    pub step: f64,
    pub loss_before: f64,
    pub loss_after: f64,
    pub accepted: bool,
}

/// Stateful line search; the only state is the current step size.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktrackingLineSearch {
    config: LineSearchConfig,
    step: f64,
}

impl BacktrackingLineSearch {
    pub fn new(config: LineSearchConfig) -> Self {
        Self {
            config,
            step: config.initial_step,
        }
    }

    pub fn config(&self) -> &LineSearchConfig {
        &self.config
    }

    /// Step size the next search will start from (under [`StepPolicy::Carried`]).
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Puts the step back to `initial_step`, as at the start of a fresh run.
    pub fn reset(&mut self) {
        self.step = self.config.initial_step;
    }

    /// Runs one line search on `factor` and commits the result into `state`.
    pub fn update<O, G>(
        &mut self,
        objective: &O,
        differentiator: &G,
        state: &mut O::State,
        factor: O::Factor,
    ) -> LineSearchOutcome
    where
        O: FactorObjective,
        G: Differentiate<O>,
    {
        if self.config.policy == StepPolicy::ResetPerFactor {
            self.step = self.config.initial_step;
        }

        let grad = differentiator.gradient(objective, state, factor);
        let current = objective.factor_values(state, factor);
        let loss_before = objective.loss(state);
        let sq_norm = grad.dot(&grad);

        let mut candidate = state.clone();
        let mut loss = trial(objective, &mut candidate, factor, current.view(), &grad, self.step);

        while !loss.is_finite() {
            self.step *= self.config.nonfinite_shrink;
            if self.step < self.config.min_step {
                debug!("Line search on {factor:?}: no finite loss above the step floor, skipping");
                return self.skip(loss_before);
            }
            loss = trial(objective, &mut candidate, factor, current.view(), &grad, self.step);
        }

        while !(loss < loss_before - self.step * self.config.c * sq_norm) {
            self.step *= self.config.tau;
            if self.step < self.config.min_step {
                debug!("Line search on {factor:?}: step collapsed to zero, skipping");
                return self.skip(loss_before);
            }
            loss = trial(objective, &mut candidate, factor, current.view(), &grad, self.step);
        }

        *state = candidate;
        LineSearchOutcome {
            step: self.step,
            loss_before,
            loss_after: loss,
            accepted: true,
        }
    }

    fn skip(&mut self, loss_before: f64) -> LineSearchOutcome {
        self.step = 0.0;
        LineSearchOutcome {
            step: 0.0,
            loss_before,
            loss_after: loss_before,
            accepted: false,
        }
    }
}

impl Default for BacktrackingLineSearch {
    fn default() -> Self {
        Self::new(LineSearchConfig::default())
    }
}

/// Sets `factor` to `current - step * grad` in `candidate` and returns the loss there.
fn trial<O: FactorObjective>(
    objective: &O,
    candidate: &mut O::State,
    factor: O::Factor,
    current: ArrayView1<f64>,
    grad: &Array1<f64>,
    step: f64,
) -> f64 {
    let moved = &current - &(grad * step);
    objective.set_factor_values(candidate, factor, moved.view());
    objective.loss(candidate)
}
