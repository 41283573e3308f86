//! End-to-end fits of the univariate Normal-Gamma model.

use mini_cavi::core::{run, CoordinateAscent, RunConfig};
use mini_cavi::data::Observations;
use mini_cavi::io::csv::{load_observations, save_observations};
use mini_cavi::univariate::{UnivariateGaussian, UnivariatePrior};
use tempfile::NamedTempFile;

#[test]
fn test_recovers_mean_and_precision() {
    let data = Observations::synthetic_univariate(100, 7.0, 2024).unwrap();
    let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data)
        .unwrap()
        .set_seed(42);
    let fit = run(&mut model, &RunConfig::default());

    assert!(fit.converged);
    let state = model.state();
    assert!((state.m_mu - 7.0).abs() < 0.5, "m_mu = {}", state.m_mu);
    let precision = state.expected_precision();
    assert!((0.5..=2.0).contains(&precision), "precision = {precision}");
}

#[test]
fn test_elbo_trace_never_decreases() {
    let data = Observations::synthetic_univariate(100, -3.0, 5).unwrap();
    for seed in 0..10 {
        let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data)
            .unwrap()
            .set_seed(seed);
        let before = model.elbo();
        let fit = run(&mut model, &RunConfig::default().set_max_sweeps(1_000));
        let first = fit.elbo_trace[0];
        assert!(first >= before - 1e-9 * before.abs());
        for w in fit.elbo_trace.windows(2) {
            assert!(w[1] >= w[0] - 1e-9 * w[0].abs(), "seed {seed}: {} -> {}", w[0], w[1]);
        }
    }
}

#[test]
fn test_fit_from_csv_matches_in_memory_fit() {
    let data = Observations::synthetic_univariate(50, 1.5, 8).unwrap();
    let file = NamedTempFile::new().expect("Could not create temp file");
    save_observations(&data, file.path()).unwrap();
    let loaded = load_observations(file.path()).unwrap();

    let config = RunConfig::default();
    let mut a = UnivariateGaussian::new(UnivariatePrior::default(), &data)
        .unwrap()
        .set_seed(3);
    let mut b = UnivariateGaussian::new(UnivariatePrior::default(), &loaded)
        .unwrap()
        .set_seed(3);
    let fa = run(&mut a, &config);
    let fb = run(&mut b, &config);
    assert_eq!(fa.elbo_trace, fb.elbo_trace);
    assert_eq!(a.state(), b.state());
}
