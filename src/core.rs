/*!
The coordinate ascent driver.

A model implements [`CoordinateAscent`]: it owns its variational state, knows
how to advance it by one sweep and how to score it. [`run`] and
[`run_with_progress`] repeatedly sweep, evaluate the ELBO and hand it to a
[`ConvergenceMonitor`] until the change between sweeps falls below the
threshold or the sweep cap is reached.

# Example

```rust
use mini_cavi::core::{run, RunConfig};
use mini_cavi::data::Observations;
use mini_cavi::univariate::{UnivariateGaussian, UnivariatePrior};

let data = Observations::synthetic_univariate(100, 7.0, 42).unwrap();
let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data)
    .unwrap()
    .set_seed(42);
let fit = run(&mut model, &RunConfig::default());
assert!(fit.converged);
assert!((model.state().m_mu - 7.0).abs() < 0.5);
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::convergence::{ConvergenceMonitor, DEFAULT_THRESHOLD};

/// A variational model optimised one block of parameters at a time.
pub trait CoordinateAscent {
    /// Advances the variational state by one full sweep over all factors.
    fn sweep(&mut self);

    /// Evidence lower bound of the current state.
    fn elbo(&self) -> f64;

    /// Short description of the current parameters, used for per-sweep logging.
    fn summary(&self) -> String;

    /// Called once before the first sweep of every run. Resets any optimiser
    /// state that should not carry over from a previous run.
    fn begin_run(&mut self) {}
}

/// Loop settings shared by every model.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Hard cap on the number of sweeps; a safety bound rather than an expected limit.
    pub max_sweeps: usize,
    /// Absolute ELBO change that counts as converged.
    pub threshold: f64,
    /// Log every sweep at `info` level instead of `debug`.
    pub trace_sweeps: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_sweeps: 10_000_000,
            threshold: DEFAULT_THRESHOLD,
            trace_sweeps: false,
        }
    }
}

impl RunConfig {
    pub fn set_max_sweeps(mut self, max_sweeps: usize) -> Self {
        self.max_sweeps = max_sweeps;
        self
    }

    pub fn set_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn set_trace_sweeps(mut self, trace_sweeps: bool) -> Self {
        self.trace_sweeps = trace_sweeps;
        self
    }
}

/// Outcome of a run. The fitted parameters stay in the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Fit {
    /// ELBO after every completed sweep.
    pub elbo_trace: Vec<f64>,
    /// Whether the run stopped on the convergence criterion rather than the sweep cap.
    pub converged: bool,
    /// Wall-clock time spent in the loop.
    pub elapsed: Duration,
}

impl Fit {
    /// Number of sweeps performed.
    pub fn sweeps(&self) -> usize {
        self.elbo_trace.len()
    }

    /// ELBO of the final state, if at least one sweep ran.
    pub fn final_elbo(&self) -> Option<f64> {
        self.elbo_trace.last().copied()
    }
}

/// Runs coordinate ascent until convergence or until `config.max_sweeps` sweeps.
pub fn run<M: CoordinateAscent>(model: &mut M, config: &RunConfig) -> Fit {
    run_loop(model, config, |_, _| {})
}

/// Same as [`run`], but displays a spinner with the sweep count and current ELBO.
pub fn run_with_progress<M: CoordinateAscent>(model: &mut M, config: &RunConfig) -> Fit {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{prefix:8} {spinner} [{elapsed_precise}] {pos} sweeps | {msg}")
    {
        pb.set_style(style);
    }
    pb.set_prefix("CAVI");

    let fit = run_loop(model, config, |_, elbo| {
        pb.inc(1);
        pb.set_message(format!("ELBO≈{elbo:.6}"));
    });

    pb.finish_with_message(if fit.converged {
        "Converged!"
    } else {
        "Stopped at sweep cap"
    });
    fit
}

fn run_loop<M, F>(model: &mut M, config: &RunConfig, mut on_sweep: F) -> Fit
where
    M: CoordinateAscent,
    F: FnMut(usize, f64),
{
    let start = Instant::now();
    let mut monitor = ConvergenceMonitor::new(config.threshold);
    let mut converged = false;
    model.begin_run();

    for sweep in 0..config.max_sweeps {
        model.sweep();
        let elbo = model.elbo();

        if config.trace_sweeps {
            info!("Sweep {sweep}: {} ELBO={elbo}", model.summary());
        } else {
            debug!("Sweep {sweep}: {} ELBO={elbo}", model.summary());
        }
        on_sweep(sweep, elbo);

        if monitor.observe(elbo) {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "Stopped after {} sweeps without reaching |ΔELBO| < {:e}; convergence is potentially incomplete",
            monitor.sweeps(),
            config.threshold
        );
    }

    Fit {
        elbo_trace: monitor.into_trace(),
        converged,
        elapsed: start.elapsed(),
    }
}
