use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fuzzlab_analysis as analysis;
use fuzzlab_build::{ArtifactBuilder, ArtifactCache, BuildOutcome, BuildReport, DockerBackend};
use fuzzlab_core::config::{CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE};
use fuzzlab_core::{CancelToken, ExecutorKind, ExperimentConfig};
use fuzzlab_runner::{
    AffinityCores, DockerLauncher, FixedCores, Launcher, LocalLauncher, RunPlan, RunReport,
    Scheduler, Supervision,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "fuzzlab",
    version,
    about = "Build fuzzer images, run comparison trials and summarize the results"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExecutorArg {
    #[value(name = "docker")]
    Docker,
    #[value(name = "local")]
    Local,
}

impl From<ExecutorArg> for ExecutorKind {
    fn from(value: ExecutorArg) -> Self {
        match value {
            ExecutorArg::Docker => ExecutorKind::Docker,
            ExecutorArg::Local => ExecutorKind::Local,
        }
    }
}

#[derive(Args, Debug)]
struct ExperimentArgs {
    /// Experiment file; `fuzzlab.yaml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short = 't', long = "target", value_delimiter = ',')]
    targets: Vec<String>,
    #[arg(short = 'f', long = "fuzzer", value_delimiter = ',')]
    fuzzers: Vec<String>,
}

impl ExperimentArgs {
    fn resolve(&self) -> Result<ExperimentConfig> {
        let mut config = ExperimentConfig::discover(self.config.as_deref())?;
        if !self.targets.is_empty() {
            config.targets = self.targets.clone();
        }
        if !self.fuzzers.is_empty() {
            config.fuzzers = self.fuzzers.clone();
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Trials per (target, fuzzer) pair.
    #[arg(short = 'c', long = "count")]
    trials: Option<usize>,
    /// Per-trial wall-clock budget in seconds.
    #[arg(long = "max-time")]
    timeout_secs: Option<f64>,
    /// Concurrent trials; 0 runs them one at a time.
    #[arg(short = 'p', long = "parallel")]
    concurrency: Option<usize>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    executor: Option<ExecutorArg>,
    #[arg(long, value_delimiter = ',')]
    cores: Option<Vec<usize>>,
    /// Local executor command, given after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut ExperimentConfig) {
        if let Some(trials) = self.trials {
            config.run.trials = trials;
        }
        if let Some(timeout) = self.timeout_secs {
            config.run.timeout_secs = timeout;
        }
        if let Some(concurrency) = self.concurrency {
            config.run.concurrency = concurrency;
        }
        if let Some(dir) = &self.data_dir {
            config.run.data_dir = dir.clone();
        }
        if let Some(executor) = self.executor {
            config.run.executor = executor.into();
        }
        if let Some(cores) = &self.cores {
            config.run.cores = Some(cores.clone());
        }
        if !self.command.is_empty() {
            config.run.command = self.command.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a template experiment file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved experiment without building or running anything.
    Describe {
        #[command(flatten)]
        experiment: ExperimentArgs,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    /// Build the base, target and fuzzer images.
    Build {
        #[command(flatten)]
        experiment: ExperimentArgs,
        /// Concurrent builds; 0 builds sequentially and stops at the first failure.
        #[arg(short = 'p', long = "parallel")]
        concurrency: Option<usize>,
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run every (target, fuzzer, trial) under the time budget.
    Run {
        #[command(flatten)]
        experiment: ExperimentArgs,
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    /// Extract the raw per-trial results table from a run directory.
    Collect {
        #[arg(long, default_value = "results")]
        data_dir: PathBuf,
        /// Output CSV; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Summarize a raw results table per (target, fuzzer).
    Aggregate {
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

/// What a command produced: an optional JSON payload and whether the
/// process should exit cleanly.
struct Outcome {
    payload: Option<Value>,
    success: bool,
}

impl Outcome {
    fn done() -> Self {
        Self {
            payload: None,
            success: true,
        }
    }

    fn json(payload: Value, success: bool) -> Self {
        Self {
            payload: Some(payload),
            success,
        }
    }

    fn text(success: bool) -> Self {
        Self {
            payload: None,
            success,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(outcome) => {
            if let Some(payload) = &outcome.payload {
                emit_json(payload);
            }
            if !outcome.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// First SIGINT/SIGTERM stops dispatch and tears down running trials; a
/// second one kills them without waiting out the grace period.
fn install_cancel_handler() -> Result<CancelToken> {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::Signals;

    let cancel = CancelToken::new();
    let mut signals = Signals::new(TERM_SIGNALS)?;
    let token = cancel.clone();
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                let name = signal_hook::low_level::signal_name(signal).unwrap_or("signal");
                on_interrupt(&token, name);
            }
        })?;
    Ok(cancel)
}

fn on_interrupt(token: &CancelToken, signal: &str) {
    if token.is_cancelled() {
        tracing::warn!(signal, "interrupted again, killing running trials");
        token.force();
    } else {
        tracing::warn!(signal, "interrupted, stopping dispatch");
        token.cancel();
    }
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Init { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fuzzlab_core::ensure_dir(parent)?;
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: list targets and fuzzers in {}", path.display());
            println!("next: fuzzlab build && fuzzlab run");
            Ok(Outcome::done())
        }
        Commands::Describe {
            experiment,
            run,
            json,
        } => {
            let mut config = experiment.resolve()?;
            run.apply(&mut config);
            config.validate()?;
            if json {
                return Ok(Outcome::json(
                    json!({
                        "ok": true,
                        "command": "describe",
                        "experiment": describe_json(&config),
                    }),
                    true,
                ));
            }
            print_description(&config);
            Ok(Outcome::done())
        }
        Commands::Build {
            experiment,
            concurrency,
            no_cache,
            json,
        } => {
            let mut config = experiment.resolve()?;
            if let Some(concurrency) = concurrency {
                config.build.concurrency = concurrency;
            }
            config.validate()?;
            let cancel = install_cancel_handler()?;
            let report = build(&config, !no_cache, cancel)?;
            let success = report.is_success();
            if json {
                return Ok(Outcome::json(build_json(&report), success));
            }
            print_build_report(&report);
            Ok(Outcome::text(success))
        }
        Commands::Run {
            experiment,
            run,
            json,
        } => {
            let mut config = experiment.resolve()?;
            run.apply(&mut config);
            config.validate()?;
            let cancel = install_cancel_handler()?;
            let plan = run_plan(&config);
            let report = match config.run.executor {
                ExecutorKind::Docker => schedule(
                    DockerLauncher::new(config.build.image_prefix.clone()),
                    &config,
                    &plan,
                    cancel.clone(),
                )?,
                ExecutorKind::Local => schedule(
                    LocalLauncher::new(config.run.command.clone()),
                    &config,
                    &plan,
                    cancel.clone(),
                )?,
            };
            let tally = report.tally();
            let success = tally.failed == 0 && !cancel.is_cancelled();
            if json {
                return Ok(Outcome::json(
                    json!({
                        "ok": success,
                        "command": "run",
                        "experiment": describe_json(&config),
                        "tally": tally,
                        "failures": report.failures().iter().map(|o| json!({
                            "trial": o.key.to_string(),
                            "status": o.status.as_str(),
                            "exit_code": o.exit_code,
                            "error": o.error,
                        })).collect::<Vec<_>>(),
                        "cancelled": cancel.is_cancelled(),
                    }),
                    success,
                ));
            }
            print_run_report(&config, &report);
            Ok(Outcome::text(success))
        }
        Commands::Collect { data_dir, out } => {
            let records = analysis::collect(&data_dir)?;
            match out {
                Some(path) => {
                    analysis::write_records(&path, &records)?;
                    println!("wrote: {} ({} records)", path.display(), records.len());
                }
                None => analysis::emit_records(std::io::stdout().lock(), &records)?,
            }
            Ok(Outcome::done())
        }
        Commands::Aggregate { input, out, json } => {
            let records = analysis::read_records(&input)?;
            let stats = analysis::aggregate(&records);
            if let Some(path) = &out {
                analysis::write_summary(path, &stats)?;
            }
            if json {
                return Ok(Outcome::json(
                    json!({
                        "ok": true,
                        "command": "aggregate",
                        "records": records.len(),
                        "summary": stats,
                        "out": out.as_ref().map(|p| p.display().to_string()),
                    }),
                    true,
                ));
            }
            match out {
                Some(path) => println!("wrote: {} ({} groups)", path.display(), stats.len()),
                None => print!("{}", analysis::format_summary(&stats)?),
            }
            Ok(Outcome::done())
        }
    }
}

fn build(config: &ExperimentConfig, use_cache: bool, cancel: CancelToken) -> Result<BuildReport> {
    let settings = &config.build;
    let mut backend = DockerBackend::new(&settings.root, &settings.image_prefix);
    if settings.concurrency > 0 {
        backend = backend.with_log_dir(&settings.log_dir);
    }
    let mut builder = ArtifactBuilder::new(backend, settings.concurrency).with_cancel(cancel);
    if use_cache {
        builder = builder.with_cache(ArtifactCache::new(&settings.cache_dir));
    }
    builder.build_all(&config.targets, &config.fuzzers)
}

fn run_plan(config: &ExperimentConfig) -> RunPlan {
    RunPlan {
        targets: config.targets.clone(),
        fuzzers: config.fuzzers.clone(),
        trials: config.run.trials,
        timeout: config.run.timeout(),
        concurrency: config.run.concurrency,
        data_dir: config.run.data_dir.clone(),
    }
}

fn schedule(
    launcher: impl Launcher + 'static,
    config: &ExperimentConfig,
    plan: &RunPlan,
    cancel: CancelToken,
) -> Result<RunReport> {
    let supervision = Supervision {
        grace: config.run.grace(),
        poll: config.run.poll_interval(),
    };
    let scheduler = match &config.run.cores {
        Some(cores) => Scheduler::new(launcher, FixedCores(cores.clone())),
        None => Scheduler::new(launcher, AffinityCores),
    };
    scheduler
        .with_supervision(supervision)
        .with_cancel(cancel)
        .run(plan)
}

fn describe_json(config: &ExperimentConfig) -> Value {
    json!({
        "targets": config.targets,
        "fuzzers": config.fuzzers,
        "total_trials": config.total_trials(),
        "build": config.build,
        "run": config.run,
    })
}

fn print_description(config: &ExperimentConfig) {
    println!("targets: {}", config.targets.join(", "));
    println!("fuzzers: {}", config.fuzzers.join(", "));
    println!(
        "trials: {} x {} x {} = {}",
        config.run.trials,
        config.targets.len(),
        config.fuzzers.len(),
        config.total_trials()
    );
    println!("timeout_secs: {}", config.run.timeout_secs);
    println!("build_concurrency: {}", config.build.concurrency);
    println!("run_concurrency: {}", config.run.concurrency);
    println!("executor: {}", config.run.executor.as_str());
    if config.run.executor == ExecutorKind::Local {
        println!("command: {}", config.run.command.join(" "));
    }
    match &config.run.cores {
        Some(cores) => println!("cores: {:?}", cores),
        None => println!("cores: affinity mask"),
    }
    println!("data_dir: {}", config.run.data_dir.display());
}

fn build_json(report: &BuildReport) -> Value {
    let artifacts: Vec<Value> = report
        .outcomes
        .iter()
        .map(|(id, outcome)| {
            let (status, detail) = match outcome {
                BuildOutcome::Ready { cached } => ("ready", json!({ "cached": cached })),
                BuildOutcome::Failed(reason) => ("failed", json!({ "reason": reason })),
                BuildOutcome::Skipped(reason) => ("skipped", json!({ "reason": reason })),
            };
            json!({ "artifact": id.to_string(), "status": status, "detail": detail })
        })
        .collect();
    json!({
        "ok": report.is_success(),
        "command": "build",
        "ready": report.ready_count(),
        "artifacts": artifacts,
    })
}

fn print_build_report(report: &BuildReport) {
    for (id, outcome) in &report.outcomes {
        match outcome {
            BuildOutcome::Ready { cached: true } => println!("ready    {} (cached)", id),
            BuildOutcome::Ready { cached: false } => println!("ready    {}", id),
            BuildOutcome::Failed(reason) => println!("failed   {}: {}", id, reason),
            BuildOutcome::Skipped(reason) => println!("skipped  {}: {}", id, reason),
        }
    }
    println!(
        "built: {}/{} artifacts ready",
        report.ready_count(),
        report.outcomes.len()
    );
    let failures = report.failures();
    if !failures.is_empty() {
        println!("failed builds:");
        for (id, _) in failures {
            println!("  {}", id);
        }
    }
}

fn print_run_report(config: &ExperimentConfig, report: &RunReport) {
    let tally = report.tally();
    println!(
        "trials: {} completed, {} timed out, {} failed, {} cancelled, {} not started",
        tally.completed, tally.timed_out, tally.failed, tally.cancelled, tally.skipped
    );
    let failures = report.failures();
    if !failures.is_empty() {
        println!("failed trials:");
        for outcome in failures {
            match &outcome.error {
                Some(error) => println!("  {}: {}", outcome.key, error),
                None => println!(
                    "  {}: exit code {}",
                    outcome.key,
                    outcome
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "none".to_string())
                ),
            }
        }
    }
    println!("data_dir: {}", config.run.data_dir.display());
    println!(
        "next: fuzzlab collect --data-dir {} --out results.csv",
        config.run.data_dir.display()
    );
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Build { json, .. }
        | Commands::Run { json, .. }
        | Commands::Aggregate { json, .. } => *json,
        Commands::Init { .. } | Commands::Collect { .. } => false,
    }
}
