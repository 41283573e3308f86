use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};

use mini_cavi::core::{run, run_with_progress, CoordinateAscent, Fit, RunConfig};
use mini_cavi::data::Observations;
use mini_cavi::gradient::{CentralDifference, Differentiate};
use mini_cavi::io::csv::{load_observations, save_assignments, save_observations, save_trace};
use mini_cavi::line_search::{LineSearchConfig, StepPolicy};
use mini_cavi::mixture::{MixtureCavi, MixtureModel, MixturePrior};
use mini_cavi::univariate::{UnivariateGaussian, UnivariatePrior};

#[derive(Parser)]
#[command(name = "mini-cavi")]
#[command(about = "Coordinate ascent variational inference for Gaussian models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a univariate Gaussian with unknown mean and precision
    Univariate(UnivariateArgs),
    /// Fit a mixture of Gaussians with unknown means
    Mixture(MixtureArgs),
    /// Write a synthetic labelled mixture dataset
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct UnivariateArgs {
    /// CSV dataset; its first coordinate column is used. Synthetic data if omitted
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Number of synthetic samples
    #[arg(long, default_value_t = 100)]
    n_elements: usize,

    /// Mean of the synthetic samples
    #[arg(long, default_value_t = 7.0)]
    data_mean: f64,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct MixtureArgs {
    /// CSV dataset (x0.. columns, optional zn). Synthetic data if omitted
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Number of components
    #[arg(short, default_value_t = 2)]
    k: usize,

    /// Restart every factor's line search from the initial step
    #[arg(long)]
    reset_step: bool,

    /// Differentiate every factor numerically (in parallel)
    #[arg(long)]
    numeric_gradient: bool,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct SimulateArgs {
    /// Output CSV path
    #[arg(long)]
    output: PathBuf,

    /// Number of observations
    #[arg(long, default_value_t = 100)]
    n_elements: usize,

    /// Number of components
    #[arg(short, default_value_t = 2)]
    k: usize,

    /// Dimensionality
    #[arg(short, default_value_t = 2)]
    d: usize,

    /// Centers are spread along the diagonal of [-spread, spread]^D
    #[arg(long, default_value_t = 5.0)]
    spread: f64,

    /// Standard deviation around each center
    #[arg(long, default_value_t = 1.0)]
    scale: f64,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Options shared by the fitting subcommands.
#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 10_000_000)]
    max_sweeps: usize,

    /// Seed for data generation and initialisation. Entropy-seeded if omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Report the elapsed time
    #[arg(long, overrides_with = "no_timing")]
    timing: bool,
    #[arg(long, overrides_with = "timing")]
    no_timing: bool,

    /// Report the number of sweeps
    #[arg(long, overrides_with = "no_n_iter")]
    n_iter: bool,
    #[arg(long, overrides_with = "n_iter")]
    no_n_iter: bool,

    /// Report the final ELBO
    #[arg(long, overrides_with = "no_elbo")]
    elbo: bool,
    #[arg(long, overrides_with = "elbo")]
    no_elbo: bool,

    /// Log every sweep (on by default)
    #[arg(long, overrides_with = "no_debug")]
    debug: bool,
    #[arg(long, overrides_with = "debug")]
    no_debug: bool,

    /// Write data, assignments and responsibilities to this CSV for plotting
    #[arg(long)]
    plot_data: Option<PathBuf>,

    /// Write the ELBO trace to this CSV
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Show a progress spinner
    #[arg(long)]
    progress: bool,
}

impl RunArgs {
    fn config(&self) -> RunConfig {
        RunConfig::default()
            .set_max_sweeps(self.max_sweeps)
            .set_trace_sweeps(self.debug || !self.no_debug)
    }

    fn fit<M: CoordinateAscent>(&self, model: &mut M) -> Fit {
        if self.progress {
            run_with_progress(model, &self.config())
        } else {
            run(model, &self.config())
        }
    }

    fn report(&self, fit: &Fit) -> Result<()> {
        if self.timing && !self.no_timing {
            println!("Duration: {:?}", fit.elapsed);
        }
        if self.n_iter && !self.no_n_iter {
            println!("Iterations: {}", fit.sweeps());
        }
        if self.elbo && !self.no_elbo {
            if let Some(elbo) = fit.final_elbo() {
                println!("ELBO: {elbo}");
            }
        }
        if !fit.converged {
            println!("Stopped at the sweep cap; convergence is potentially incomplete");
        }
        if let Some(path) = &self.trace {
            save_trace(&fit.elbo_trace, path)
                .with_context(|| format!("writing ELBO trace to {}", path.display()))?;
            info!("Saved ELBO trace to {}", path.display());
        }
        Ok(())
    }

    fn save_plot_data(
        &self,
        data: &Observations,
        assignments: &Array1<usize>,
        phi: &Array2<f64>,
    ) -> Result<()> {
        if let Some(path) = &self.plot_data {
            save_assignments(data, assignments.view(), phi.view(), path)
                .with_context(|| format!("writing plot data to {}", path.display()))?;
            info!("Saved plot data to {}", path.display());
        }
        Ok(())
    }
}

fn load(path: &Path) -> Result<Observations> {
    let data = load_observations(path)
        .with_context(|| format!("loading dataset {}", path.display()))?;
    info!("Loaded {} x {} observations from {}", data.n(), data.d(), path.display());
    Ok(data)
}

fn univariate(args: &UnivariateArgs) -> Result<()> {
    let data = match &args.dataset {
        Some(path) => Observations::from_scalars(load(path)?.column(0).to_vec())?,
        None => Observations::synthetic_univariate(
            args.n_elements,
            args.data_mean,
            args.run.seed.unwrap_or_else(rand::random),
        )?,
    };

    let mut model = UnivariateGaussian::new(UnivariatePrior::default(), &data)?;
    if let Some(seed) = args.run.seed {
        model = model.set_seed(seed);
    }

    let fit = args.run.fit(&mut model);
    let state = model.state();
    println!("Mu={} Precision={}", state.m_mu, state.expected_precision());
    args.run.report(&fit)?;

    let n = data.n();
    args.run
        .save_plot_data(&data, &Array1::zeros(n), &Array2::ones((n, 1)))
}

fn mixture(args: &MixtureArgs) -> Result<()> {
    let data = match &args.dataset {
        Some(path) => load(path)?,
        None => Observations::synthetic_mixture(
            100,
            Observations::diagonal_centers(args.k, 2, 5.0).view(),
            1.0,
            args.run.seed.unwrap_or_else(rand::random),
        )?,
    };

    let policy = if args.reset_step {
        StepPolicy::ResetPerFactor
    } else {
        StepPolicy::Carried
    };
    let mut cavi = MixtureCavi::new(MixturePrior::new(args.k, data.d()), &data)?
        .set_line_search(LineSearchConfig::default().set_policy(policy));
    if let Some(seed) = args.run.seed {
        cavi = cavi.set_seed(seed);
    }

    if args.numeric_gradient {
        let cavi = cavi.with_differentiator(CentralDifference::default().set_parallel(true));
        fit_mixture(cavi, &data, &args.run)
    } else {
        fit_mixture(cavi, &data, &args.run)
    }
}

fn fit_mixture<G: Differentiate<MixtureModel>>(
    mut cavi: MixtureCavi<G>,
    data: &Observations,
    run: &RunArgs,
) -> Result<()> {
    let fit = run.fit(&mut cavi);
    println!("{}", cavi.summary());
    run.report(&fit)?;

    let state = cavi.state();
    run.save_plot_data(data, &state.assignments(), &state.phi())
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let centers = Observations::diagonal_centers(args.k, args.d, args.spread);
    let data =
        Observations::synthetic_mixture(args.n_elements, centers.view(), args.scale, args.seed)?;
    save_observations(&data, &args.output)
        .with_context(|| format!("writing dataset to {}", args.output.display()))?;
    info!(
        "Wrote {} observations from {} components to {}",
        data.n(),
        args.k,
        args.output.display()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Univariate(args) => univariate(args)?,
        Commands::Mixture(args) => mixture(args)?,
        Commands::Simulate(args) => simulate(args)?,
    }

    Ok(())
}
