//! cellab: repeated iperf3 runs from the terminal.
//!
//! - `run` builds the iperf3 command from profile flags
//! - `exec` takes a ready-made iperf3 command line and runs it once
//! - `--simulate` swaps iperf3 for a synthetic link, for local dev
//! - Ctrl-C stops the run; the summary and log file list are still printed

mod process;
mod terminal;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cellab_core::config::LabConfig;
use cellab_core::profile::{Direction, Protocol, TestProfile, DEFAULT_DURATION_S, DEFAULT_PORT};
use cellab_core::simulate::{LinkModel, SimulatedEngine};
use cellab_core::ui::{BandwidthPrompt, FixedDecision};
use cellab_core::{
    Collaborators, ExecutionEngine, IterationConfig, RunOrchestrator, RunOutcome, Strategy,
    TestArguments,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::process::{ProcessEngine, DEFAULT_STOP_GRACE, IPERF_BIN_ENV};
use crate::terminal::{StdinPrompt, StdoutPresenter, TerminalTimer, TracingHooks};

/// Adaptive iperf3 test runner.
#[derive(Parser, Debug)]
#[command(name = "cellab", version, about = "Repeated iperf3 runs with adaptive bandwidth")]
struct Cli {
    /// TOML config file (run defaults, tuning, log settings).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for per-run log files. Overrides the config file.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Write a JSON run report to this path.
    #[arg(long, global = true)]
    report_json: Option<PathBuf>,

    /// Always accept bandwidth reductions without asking.
    #[arg(long, global = true, default_value_t = false)]
    assume_yes: bool,

    /// Run against a simulated link instead of iperf3.
    #[arg(long, global = true, default_value_t = false)]
    simulate: bool,

    /// Capacity of the simulated link in Mbps.
    #[arg(long, global = true, default_value_t = 250.0)]
    sim_capacity: f64,

    /// iperf3 binary.
    #[arg(long, global = true, env = IPERF_BIN_ENV, default_value = "iperf3")]
    iperf_bin: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the iperf3 command from flags and run it.
    Run(RunArgs),
    /// Run a ready-made iperf3 command line once.
    Exec {
        /// The command, e.g. `iperf3 -c 10.0.0.1 -u -b 50M`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// iperf3 server host.
    #[arg(short = 'c', long)]
    server: String,

    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds per iteration.
    #[arg(short = 't', long, default_value_t = DEFAULT_DURATION_S)]
    duration: u32,

    /// Report interval in seconds.
    #[arg(short = 'i', long, default_value_t = 1)]
    interval: u32,

    /// Parallel streams.
    #[arg(short = 'P', long)]
    parallel: Option<u32>,

    /// upload, download or bidir.
    #[arg(long, default_value_t = Direction::Upload)]
    direction: Direction,

    /// tcp, udp, udp-incremental, smart-ramp or hybrid.
    #[arg(long, default_value_t = Protocol::Tcp)]
    protocol: Protocol,

    /// Target bandwidth in Mbps (UDP modes).
    #[arg(short = 'b', long)]
    bandwidth: Option<u32>,

    #[arg(short = 'd', long, default_value_t = false)]
    debug: bool,

    #[arg(short = 'V', long, default_value_t = false)]
    verbose: bool,

    /// Number of iterations. Overrides the config file.
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Seconds to wait between iterations. Overrides the config file.
    #[arg(short = 'w', long)]
    wait: Option<u64>,

    /// Offer a bandwidth reduction on sustained packet loss.
    #[arg(long, default_value_t = false)]
    auto_reduce: bool,
}

impl RunArgs {
    fn profile(&self) -> TestProfile {
        TestProfile {
            server: self.server.clone(),
            port: self.port,
            duration_s: self.duration,
            interval_s: self.interval,
            parallel: self.parallel,
            direction: self.direction,
            protocol: self.protocol,
            bandwidth_mbps: self.bandwidth,
            debug: self.debug,
            verbose: self.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let lab = load_config(cli.config.as_deref())?;
    let (args, iteration_config) = plan(&cli.command, &lab)?;

    let mut log_config = lab.log.clone();
    if let Some(dir) = &cli.log_dir {
        log_config.dir = Some(dir.clone());
    }

    tracing::info!(
        simulate = cli.simulate,
        iterations = iteration_config.iterations,
        command = %args,
        "cellab starting"
    );

    let engine: Arc<dyn ExecutionEngine> = if cli.simulate {
        Arc::new(SimulatedEngine::new(LinkModel {
            capacity_mbps: cli.sim_capacity,
            ..Default::default()
        }))
    } else {
        Arc::new(ProcessEngine::new(cli.iperf_bin.clone(), DEFAULT_STOP_GRACE))
    };

    let prompt: Arc<dyn BandwidthPrompt> = if cli.assume_yes {
        Arc::new(FixedDecision(true))
    } else {
        Arc::new(StdinPrompt::spawn(lab.tuning.decision_countdown))
    };
    let ui = Collaborators {
        presenter: Arc::new(StdoutPresenter),
        timer: Arc::new(TerminalTimer::new()),
        prompt,
        hooks: Arc::new(TracingHooks),
    };

    let orchestrator = Arc::new(RunOrchestrator::new(
        engine,
        ui,
        lab.tuning.clone(),
        log_config,
    ));
    let handle = orchestrator.start_test(args, iteration_config)?;

    // ── Shutdown handling ───────────────────────────────────────
    let stopper = orchestrator.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, stopping run");
            stopper.stop_tests().await;
        }
    });

    let report = handle.wait().await?;
    signal_handle.abort();

    if let Some(path) = &cli.report_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "report written");
    }

    tracing::info!(outcome = ?report.outcome, "cellab stopped");
    Ok(match report.outcome {
        RunOutcome::CompletedWithErrors => ExitCode::FAILURE,
        RunOutcome::Completed | RunOutcome::Stopped => ExitCode::SUCCESS,
    })
}

fn load_config(path: Option<&Path>) -> anyhow::Result<LabConfig> {
    let Some(path) = path else {
        return Ok(LabConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    LabConfig::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

/// Argument list and iteration settings for the chosen subcommand.
fn plan(command: &Command, lab: &LabConfig) -> anyhow::Result<(TestArguments, IterationConfig)> {
    match command {
        Command::Run(run) => {
            let (args, strategy) = run.profile().build()?;
            let config = IterationConfig::for_args(
                &args,
                run.iterations.unwrap_or(lab.iterations),
                run.wait.map(Duration::from_secs).unwrap_or(lab.wait_time),
            )
            .with_strategy(merge(strategy, lab.strategy))
            .with_auto_reduce(run.auto_reduce || lab.auto_reduce);
            config.validate()?;
            Ok((args, config))
        }
        Command::Exec { command } => {
            let args = exec_arguments(command);
            let config = IterationConfig::for_args(&args, 1, Duration::from_secs(1))
                .with_auto_reduce(lab.auto_reduce);
            Ok((args, config))
        }
    }
}

/// A single quoted word is split like a shell line; several words are
/// taken as already split.
fn exec_arguments(command: &[String]) -> TestArguments {
    let args = match command {
        [line] => TestArguments::parse_command(line),
        words => TestArguments::new(words.iter().cloned()),
    };
    args.without_program()
}

fn merge(a: Strategy, b: Strategy) -> Strategy {
    Strategy {
        incremental_ramp_up: a.incremental_ramp_up || b.incremental_ramp_up,
        smart_ramp_up: a.smart_ramp_up || b.smart_ramp_up,
        hybrid: a.hybrid || b.hybrid,
    }
}
