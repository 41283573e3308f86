//! Tracks successive ELBO values and decides when a CAVI run has converged.

/// Default absolute ELBO change below which a run is considered converged.
pub const DEFAULT_THRESHOLD: f64 = 1e-6;

/// Append-only record of the ELBO after every completed sweep, plus the
/// stopping rule `|elbo_t - elbo_{t-1}| < threshold`.
///
/// The first observation never signals convergence. A decreasing ELBO does not
/// stop the run by itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceMonitor {
    threshold: f64,
    trace: Vec<f64>,
}

impl ConvergenceMonitor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            trace: Vec::new(),
        }
    }

    /// Records the ELBO of a finished sweep and returns `true` once the change
    /// from the previous sweep drops below the threshold.
    pub fn observe(&mut self, elbo: f64) -> bool {
        let converged = self
            .trace
            .last()
            .is_some_and(|&previous| (elbo - previous).abs() < self.threshold);
        self.trace.push(elbo);
        converged
    }

    /// Number of sweeps observed so far.
    pub fn sweeps(&self) -> usize {
        self.trace.len()
    }

    pub fn last(&self) -> Option<f64> {
        self.trace.last().copied()
    }

    pub fn trace(&self) -> &[f64] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<f64> {
        self.trace
    }
}

impl Default for ConvergenceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}
