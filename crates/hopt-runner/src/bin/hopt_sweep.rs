use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use hopt_runner::{CommandLauncher, HyperOptimizer, SweepDocument, TrialOutcome};
use hopt_search::Strategy;
use tracing_subscriber::EnvFilter;

/// How trials are spread over processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Model {
    /// One fresh process per trial, a batch at a time
    Forked,
    /// Persistent workers, each trial leasing one id from --gpus
    GpuPool,
    /// Persistent workers with a random start delay per trial
    CpuPool,
}

/// Run a command for every hyperparameter trial.
///
/// Forked children receive their trial as JSON on stdin and the variables
/// HOPT_TRIAL_NUMBER, HOPT_BATCH_INDEX and HOPT_BATCH_POSITION. Pool workers
/// receive one JSON envelope per line and answer each with a line
/// `HOPT_RESULT {"ok": <result>}` or `HOPT_RESULT {"err": "<message>"}`.
#[derive(Parser, Debug)]
#[command(name = "hopt-sweep", version)]
struct Args {
    /// Sweep document: declarations, base configuration, strategy and seed
    #[arg(long)]
    space: PathBuf,

    /// JSON object whose keys override the base configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of trials to generate
    #[arg(long, default_value_t = 10)]
    trials: usize,

    /// Processes per batch, or pool workers
    #[arg(long, default_value_t = 4)]
    parallel: usize,

    /// Execution model
    #[arg(long, value_enum, default_value_t = Model::Forked)]
    model: Model,

    /// GPU id sets for the GPU pool, e.g. `--gpus 0 --gpus 1,2`
    #[arg(long = "gpus", default_value = "0")]
    gpus: Vec<String>,

    /// Override the document's strategy (grid or random)
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Override the document's seed
    #[arg(long)]
    seed: Option<u64>,

    /// Print the generated trials instead of running anything
    #[arg(long)]
    dry_run: bool,

    /// Program and arguments to run per trial
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut doc = SweepDocument::from_json_file(&args.space)
        .with_context(|| format!("reading sweep document {}", args.space.display()))?;
    if let Some(strategy) = args.strategy {
        doc.strategy = strategy;
    }
    if args.seed.is_some() {
        doc.seed = args.seed;
    }

    let space = doc.declare()?;
    let mut base = doc.base_config(&space);
    if let Some(path) = &args.config {
        base.overlay_json_file(path)
            .with_context(|| format!("applying config overlay {}", path.display()))?;
    }
    let optimizer = HyperOptimizer::new(space, base, doc.optimizer_config());

    if args.dry_run {
        for config in optimizer.trials(args.trials) {
            println!("{config}");
        }
        return Ok(());
    }

    let (program, rest) = args
        .command
        .split_first()
        .context("no command given after `--`")?;
    let launcher = CommandLauncher::new(program).args(rest);

    let failed: Vec<usize> = match args.model {
        Model::Forked => optimizer.run_forked(&launcher, args.trials, args.parallel)?.failed_children,
        Model::GpuPool => {
            let outcomes: Vec<TrialOutcome<serde_json::Value>> =
                optimizer.run_gpu_pool(&launcher, args.trials, args.gpus.as_slice(), args.parallel)?;
            print_outcomes(&outcomes)?
        }
        Model::CpuPool => {
            let outcomes: Vec<TrialOutcome<serde_json::Value>> =
                optimizer.run_cpu_pool(&launcher, args.trials, args.parallel)?;
            print_outcomes(&outcomes)?
        }
    };

    if !failed.is_empty() {
        anyhow::bail!("{} of {} trials failed: {:?}", failed.len(), args.trials, failed);
    }
    Ok(())
}

/// Print one JSON line per outcome and return the failed trial numbers.
fn print_outcomes(outcomes: &[TrialOutcome<serde_json::Value>]) -> anyhow::Result<Vec<usize>> {
    for outcome in outcomes {
        println!("{}", serde_json::to_string(outcome)?);
    }
    Ok(outcomes
        .iter()
        .filter(|o| !o.is_success())
        .map(|o| o.trial)
        .collect())
}
