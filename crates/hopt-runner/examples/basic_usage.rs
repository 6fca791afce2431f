use hopt_runner::*;
use hopt_search::{OptList, OptRange, ParameterSpace, Strategy};
use hopt_types::TrialConfig;

fn train(config: &TrialConfig, ctx: &TrialContext) -> Result<f64, String> {
    let lr = config.get_f64("learningrate").ok_or("missing learning rate")?;
    let layers = config.get_i64("layers").ok_or("missing layers")?;
    if let Some(position) = ctx.batch_position() {
        println!("child {position} training trial {}", ctx.trial());
    }
    Ok(1.0 / (1.0 + lr * layers as f64))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // When launched as a pool worker or forked child, serve trials and exit.
    if let Some(code) = serve_if_child(train) {
        std::process::exit(code);
    }

    println!("hopt basic usage example");

    let mut space = ParameterSpace::with_seed(7);
    space.opt_range(
        OptRange::new("--learning-rate", 1e-4, 1e-1)
            .samples(4)
            .log_base(10.0)
            .tunable(),
    )?;
    space.opt_list(OptList::new("--layers", [2, 4, 8]).tunable())?;

    let base = TrialConfig::new()
        .with("learningrate", 0.01)
        .with("layers", 2)
        .with("epochs", 10);
    let config = OptimizerConfig::new(Strategy::Random)
        .with_seed(7)
        .with_scheduler(SchedulerConfig::immediate());
    let optimizer = HyperOptimizer::new(space, base, config);

    for trial in optimizer.generate_trials(2) {
        println!("{trial}");
    }

    let launcher = SelfExecLauncher::new();
    let outcomes: Vec<TrialOutcome<f64>> = optimizer.run_gpu_pool(&launcher, 6, &["0", "1"], 2)?;
    for outcome in &outcomes {
        println!("trial {} -> {:?}", outcome.trial, outcome.result);
    }

    let cpu: Vec<TrialOutcome<f64>> = optimizer.run_cpu_pool(&launcher, 4, 2)?;
    println!("CPU pool finished {} trials", cpu.len());

    let threads = optimizer.run_cpu_pool_in_process(train, 4, 2)?;
    println!("in-process CPU pool finished {} trials", threads.len());

    let summary = optimizer.run_forked(&launcher, 3, 2)?;
    println!("forked batches: {:?}", summary.batch_sizes);

    if let Some(report) = optimizer.last_report() {
        println!("last run {} took {}", report.id, report.finished_at - report.started_at);
    }
    Ok(())
}
