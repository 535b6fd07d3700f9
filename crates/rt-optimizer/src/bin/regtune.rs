//! RegTune command line.
//!
//! Usage:
//!   regtune start  --cohort pairs.json [--config session.json] [overrides]
//!   regtune resume --cohort pairs.json --work-dir optimize [--trials N]
//!   regtune report --work-dir optimize
//!
//! Exit status: 0 success, 2 configuration error, 3 systemic failure,
//! 1 anything else.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rt_optimizer::{
    report_best, CheckpointStore, FitnessEvaluator, ProposerKind, SearchReport, SearchSession,
    SessionConfig, StopSignal,
};
use rt_pipeline::{AntsToolkit, EngineConfig, ExecutionEngine, PipelineBuilder};
use rt_types::{config_error, Cohort, RtError};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "regtune", version, about = "Registration parameter search over ANTs pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new search.
    Start(StartArgs),
    /// Continue the search checkpointed in a work directory.
    Resume(ResumeArgs),
    /// Print the best result recorded in a work directory.
    Report {
        #[arg(long, default_value = "optimize")]
        work_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON list of {id, fixed_image, moving_image} subject pairs.
    #[arg(long)]
    cohort: PathBuf,

    /// Only use the first N subjects of the cohort.
    #[arg(long)]
    max_subjects: Option<usize>,

    /// Subject pipelines run in parallel.
    #[arg(long)]
    workers: Option<usize>,

    /// Total trial budget, including trials already checkpointed.
    #[arg(long)]
    trials: Option<usize>,

    /// Directory holding the ANTs executables (default: PATH).
    #[arg(long)]
    ants_bin: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct StartArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Session configuration file; flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Completed trials before the surrogate model is used.
    #[arg(long)]
    min_model_observations: Option<usize>,

    /// Propose every trial at random instead of from the surrogate.
    #[arg(long)]
    random: bool,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[command(flatten)]
    run: RunArgs,

    #[arg(long, default_value = "optimize")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Start(args) => start(args).await,
        Command::Resume(args) => resume(args).await,
        Command::Report { work_dir } => report(work_dir),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RtError>() {
        Some(RtError::Config(_) | RtError::Validation(_)) => 2,
        Some(RtError::Systemic(_)) => 3,
        _ => 1,
    }
}

async fn start(args: StartArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(seed) = args.seed {
        config = config.with_seed(seed);
    }
    if let Some(n) = args.min_model_observations {
        config = config.with_min_model_observations(n);
    }
    if args.random {
        config.proposer.kind = ProposerKind::Random;
    }

    if CheckpointStore::in_dir(&config.work_dir).exists() {
        return Err(config_error!(
            "{} already holds a search; use `regtune resume` to continue it",
            config.work_dir.display()
        )
        .into());
    }
    run(config, args.run).await
}

async fn resume(args: ResumeArgs) -> Result<()> {
    let checkpoint = CheckpointStore::in_dir(&args.work_dir)
        .load()?
        .ok_or_else(|| config_error!("no checkpoint found in {}", args.work_dir.display()))?;
    let config = SessionConfig::from_checkpoint(&args.work_dir, &checkpoint);
    run(config, args.run).await
}

async fn run(mut config: SessionConfig, args: RunArgs) -> Result<()> {
    if let Some(trials) = args.trials {
        config.trial_budget = trials;
    }
    if let Some(workers) = args.workers {
        config.worker_budget = workers;
    }

    let mut cohort = Cohort::from_json_file(&args.cohort)
        .with_context(|| format!("loading cohort {}", args.cohort.display()))?;
    if let Some(n) = args.max_subjects {
        cohort = cohort.truncate(n);
    }
    if cohort.is_empty() {
        return Err(config_error!("cohort is empty after --max-subjects").into());
    }
    info!(
        subjects = cohort.len(),
        workers = config.worker_budget,
        trials = config.trial_budget,
        work_dir = %config.work_dir.display(),
        "Preparing search"
    );

    let registry = AntsToolkit::new(args.ants_bin).registry();
    let engine = ExecutionEngine::new(
        EngineConfig::default().with_workers(config.worker_budget),
        registry,
    );
    let fitness = FitnessEvaluator::new(PipelineBuilder::new(), engine, cohort);

    let mut session = SearchSession::open(config, fitness)?;
    let stop = session.stop_signal();
    tokio::spawn(async move {
        if watch_interrupts(stop, tokio::signal::ctrl_c).await {
            error!("Second interrupt, aborting without finishing the current trial");
            std::process::exit(INTERRUPTED_EXIT);
        }
    });

    let report = session.run().await?;
    print_report(&report)
}

/// Exit status after a forced abort (128 + SIGINT).
const INTERRUPTED_EXIT: i32 = 130;

/// The first interrupt requests a graceful stop. Returns `true` once a
/// second interrupt arrives.
async fn watch_interrupts<S, F>(stop: StopSignal, mut interrupt: S) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = std::io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    warn!("Interrupt received, stopping after the current trial (interrupt again to abort)");
    stop.request();
    interrupt().await.is_ok()
}

fn report(work_dir: PathBuf) -> Result<()> {
    let report = report_best(&work_dir)?;
    print_report(&report)
}

fn print_report(report: &SearchReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_types::SystemicError;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "regtune", "start", "--cohort", "pairs.json", "--trials", "20", "--random",
        ])
        .unwrap();
        match cli.command {
            Command::Start(args) => {
                assert_eq!(args.run.trials, Some(20));
                assert!(args.random);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["regtune", "report"]).unwrap();
        assert!(matches!(cli.command, Command::Report { work_dir } if work_dir == PathBuf::from("optimize")));
    }

    #[tokio::test]
    async fn second_interrupt_forces_exit() {
        let stop = StopSignal::new();
        let mut received = 0;
        let forced = watch_interrupts(stop.clone(), || {
            received += 1;
            async { Ok(()) }
        })
        .await;
        assert!(forced);
        assert!(stop.is_requested());
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn unavailable_signal_handler_never_stops() {
        let stop = StopSignal::new();
        let forced = watch_interrupts(stop.clone(), || async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "no handler"))
        })
        .await;
        assert!(!forced);
        assert!(!stop.is_requested());
    }

    #[test]
    fn exit_codes_follow_error_class() {
        let config: anyhow::Error = config_error!("bad").into();
        let systemic: anyhow::Error = RtError::from(SystemicError::CheckpointMismatch {
            message: "space".into(),
        })
        .into();
        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&config), 2);
        assert_eq!(exit_code(&systemic), 3);
        assert_eq!(exit_code(&other), 1);
    }
}
