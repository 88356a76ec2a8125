//! SMC: run the bundled demonstration models through the particle filter.
//!
//! Each model subcommand filters a sequence of observations, reconstructs equally weighted
//! trajectories and reports a per-step summary (mean and standard deviation of every state field
//! together with the incremental log marginal likelihood), either on stdout or as a CSV file.
//!
//! Filter settings come from `--config <file>` (TOML or JSON) when given, from the defaults
//! otherwise; `--num-particles`, `--seed` and `--resampling-strategy` override either.
use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use nalgebra::{dmatrix, dvector};

use smc::filter::{FilterConfig, infer_trajectories};
use smc::kalman::LinearGaussianStateSpaceModel;
use smc::model::StateSpaceModel;
use smc::resample::ResamplingStrategy;
use smc::seed::Seed;
use smc::sim::{
    EPIDEMIC_CASE_COUNTS, EpidemicParameters, TrajectorySummary, epidemic_model, random_walk_model,
};
use smc::state::State;

const LONG_ABOUT: &str = "SMC: a batched particle filter and its demonstration models.

Every model subcommand filters a sequence of observations, reconstructs equally weighted
trajectories and prints a per-step summary of the inferred states. Use --output to write the
summary as CSV instead.

Filter settings are read from --config (TOML or JSON) when given. --num-particles, --seed and
--resampling-strategy override the file. Use create-config to write a configuration file with
the default settings.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "A batched particle filter and its demonstration models.", long_about = LONG_ABOUT)]
struct Cli {
    /// Filter configuration file (TOML/JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of particles per batch instance (overrides the configuration file)
    #[arg(short = 'n', long, global = true)]
    num_particles: Option<usize>,

    /// Root random seed (overrides the configuration file)
    #[arg(short, long, global = true)]
    seed: Option<u64>,

    /// Resampling scheme (overrides the configuration file)
    #[arg(long, value_enum, global = true)]
    resampling_strategy: Option<ResamplingStrategy>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "random-walk",
        about = "Infer trajectories of a biased random walk",
        long_about = "Filter a walk that starts at zero and steps up by one with a fixed probability. The observations carry no information, so the inferred trajectories show the prior dynamics."
    )]
    RandomWalk(RandomWalkArgs),
    #[command(
        name = "epidemic",
        about = "Infer the course of an outbreak from daily case counts",
        long_about = "Filter a discrete SIR model with Poisson noise against a bundled series of 40 daily case counts."
    )]
    Epidemic(EpidemicArgs),
    #[command(
        name = "linear-gaussian",
        about = "Filter a simulated linear-Gaussian model and compare with the Kalman filter",
        long_about = "Simulate observations from a two-dimensional linear-Gaussian model, filter them with particles and report the exact Kalman filter log marginal likelihood next to the particle estimate."
    )]
    LinearGaussian(LinearGaussianArgs),
    #[command(
        name = "create-config",
        about = "Write a configuration file with the default filter settings"
    )]
    CreateConfig(CreateConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RandomWalkArgs {
    /// Probability of moving up at each step
    #[arg(long, default_value_t = 0.75)]
    step_probability: f64,
    /// Number of timesteps
    #[arg(long, default_value_t = 10)]
    num_steps: usize,
    /// CSV summary output path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct EpidemicArgs {
    #[arg(long, default_value_t = 1000.0)]
    population_size: f64,
    /// Expected new infections per infected individual per day
    #[arg(long, default_value_t = 1.1)]
    infection_rate: f64,
    /// Mean number of days an individual stays infected
    #[arg(long, default_value_t = 8.0)]
    infectious_period: f64,
    #[arg(long, default_value_t = 1.0)]
    initial_infected: f64,
    /// CSV summary output path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct LinearGaussianArgs {
    /// Number of simulated timesteps
    #[arg(long, default_value_t = 50)]
    num_steps: usize,
    /// CSV summary output path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Where to write the configuration (.toml or .json)
    #[arg(short, long, default_value = "smc.toml")]
    output: PathBuf,
}

/// Initialize the logger.
///
/// Records from this crate are kept at `log_level`; dependencies are held at `warn` unless
/// `log_level` is stricter. Each line carries a timestamp, the level and the emitting module.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to append logs to (stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or a logger is already installed.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{log_level}', using 'info'");
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.min(log::LevelFilter::Warn))
        .filter_module("smc", level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });

    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

/// The configuration file (or the defaults) with the command line overrides applied.
fn resolve_config(cli: &Cli) -> Result<FilterConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading filter configuration from {}", path.display());
            FilterConfig::from_file(path)?
        }
        None => FilterConfig::default(),
    };
    if let Some(num_particles) = cli.num_particles {
        config.num_particles = num_particles;
    }
    if let Some(seed) = cli.seed {
        config.seed = Seed::new(seed);
    }
    if let Some(strategy) = cli.resampling_strategy {
        config.resampling_strategy = strategy;
    }
    config.validate()?;
    Ok(config)
}

/// Infer trajectories and report their per-step summary.
fn run_model(
    model: &StateSpaceModel,
    observations: &State,
    config: &FilterConfig,
    output: Option<&PathBuf>,
) -> Result<f64, Box<dyn Error>> {
    let (trajectories, step_log_marginal_likelihoods) =
        infer_trajectories(model, observations, config)?;
    let total = step_log_marginal_likelihoods.sum();
    if !total.is_finite() {
        warn!("Estimated log marginal likelihood is {total}; the particle weights collapsed");
    }
    let rows = TrajectorySummary::from_trajectories(&trajectories, &step_log_marginal_likelihoods)?;
    match output {
        Some(path) => {
            TrajectorySummary::to_csv(&rows, path)?;
            info!("Wrote {} summary rows to {}", rows.len(), path.display());
        }
        None => {
            println!("{:>5}  {:<16} {:>12} {:>12} {:>12}", "step", "field", "mean", "std_dev", "log_ml");
            for row in &rows {
                println!(
                    "{:>5}  {:<16} {:>12.4} {:>12.4} {:>12.4}",
                    row.step, row.field, row.mean, row.std_dev, row.log_marginal_likelihood
                );
            }
        }
    }
    Ok(total)
}

fn run_random_walk(args: &RandomWalkArgs, config: &FilterConfig) -> Result<(), Box<dyn Error>> {
    info!(
        "Random walk: step probability {}, {} steps",
        args.step_probability, args.num_steps
    );
    let model = random_walk_model(args.step_probability)?;
    let observations = State::from_vec(vec![0.0; args.num_steps]);
    let total = run_model(&model, &observations, config, args.output.as_ref())?;
    info!("Log marginal likelihood: {total:.4}");
    Ok(())
}

fn run_epidemic(args: &EpidemicArgs, config: &FilterConfig) -> Result<(), Box<dyn Error>> {
    let params = EpidemicParameters {
        population_size: args.population_size,
        infection_rate: args.infection_rate,
        infectious_period: args.infectious_period,
        initial_infected: args.initial_infected,
    };
    info!("Epidemic: {:?}, {} days of case counts", params, EPIDEMIC_CASE_COUNTS.len());
    let model = epidemic_model(params)?;
    let observations = State::from_vec(EPIDEMIC_CASE_COUNTS.to_vec());
    let total = run_model(&model, &observations, config, args.output.as_ref())?;
    info!("Log marginal likelihood: {total:.4}");
    Ok(())
}

fn run_linear_gaussian(args: &LinearGaussianArgs, config: &FilterConfig) -> Result<(), Box<dyn Error>> {
    let transition_scale = dmatrix![0.3, 0.0; -0.1, 0.2];
    let observation_scale = dmatrix![0.5, 0.0; 0.1, 0.5];
    let lgssm = LinearGaussianStateSpaceModel::new(
        dvector![0.0, 0.0],
        dmatrix![1.0, 0.0; 0.0, 1.0],
        dmatrix![1.0, -0.5; 0.4, -1.0],
        dvector![1.0, 1.0],
        &transition_scale * transition_scale.transpose(),
        dmatrix![0.1, 1.0; 1.0, 0.2],
        dvector![-0.3, -0.3],
        &observation_scale * observation_scale.transpose(),
    )?;
    let (_, observations) = lgssm.sample(args.num_steps, config.seed.fold_in(u64::MAX))?;
    let exact: f64 = lgssm.forward_filter(&observations)?.log_likelihoods.iter().sum();

    let model = lgssm.to_state_space_model()?;
    let estimate = run_model(&model, &State::Array(observations), config, args.output.as_ref())?;
    info!("Log marginal likelihood: particle estimate {estimate:.4}, Kalman filter {exact:.4}");
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs, config: &FilterConfig) -> Result<(), Box<dyn Error>> {
    config.to_file(&args.output)?;
    info!("Wrote filter configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    let config = resolve_config(&cli)?;

    match &cli.command {
        Command::RandomWalk(args) => run_random_walk(args, &config),
        Command::Epidemic(args) => run_epidemic(args, &config),
        Command::LinearGaussian(args) => run_linear_gaussian(args, &config),
        Command::CreateConfig(args) => create_config_file(args, &config),
    }
}
