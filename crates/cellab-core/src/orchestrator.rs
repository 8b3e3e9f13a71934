//! Run orchestrator: drives a whole test run and finalizes it exactly once.
//!
//! `start_test` spawns two tasks:
//!
//! - the **run task** owns the [`IterationController`] and runs the
//!   optional hybrid estimation pass, the iterations, and the delays
//!   between them;
//! - the **supervisor** joins the run task (panics included) and then
//!   finalizes.
//!
//! `stop_tests` can arrive at any time. With a run outstanding it aborts
//! the engine and cancels the run token; every suspension point of the run
//! task observes the token, so the supervisor finalizes promptly. With no
//! run outstanding it finalizes directly. Finalize is guarded by a
//! compare-and-set, so racing triggers produce one summary and one
//! `on_test_complete`.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::args::TestArguments;
use crate::config::{ControllerTuning, IterationConfig, LogConfig};
use crate::controller::{forced_stop_sink, IterationController, IterationReport};
use crate::engine::{CallbackSink, EngineSink, ExecutionEngine};
use crate::error::{IterationError, LabError};
use crate::log_sink::{LogSink, TIMESTAMP_FORMAT};
use crate::ui::Collaborators;

/// Callback run once finalization has finished.
pub type ResetFn = Box<dyn FnOnce() + Send>;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Stopped,
    CompletedWithErrors,
    Completed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Stopped => write!(f, "Test stopped by user."),
            RunOutcome::CompletedWithErrors => write!(f, "Test completed with errors."),
            RunOutcome::Completed => write!(f, "All iterations completed."),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub iterations: Vec<IterationReport>,
    pub created_files: Vec<PathBuf>,
    /// Ceiling found by the hybrid estimation pass.
    pub estimated_bandwidth_mbps: Option<u32>,
    /// `-b` of the last argument list.
    pub final_bandwidth_mbps: Option<u32>,
    pub final_step_mbps: Option<u32>,
}

/// Handle to a started run.
pub struct RunHandle {
    supervisor: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Wait for the run to be finalized.
    pub async fn wait(self) -> Result<RunReport, LabError> {
        Ok(self.supervisor.await?)
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }
}

// ── Shared run state ────────────────────────────────────────────────

/// What the run task hands back to the supervisor.
#[derive(Default)]
struct RunProgress {
    estimate: Option<u32>,
    final_bandwidth: Option<u32>,
    final_step: Option<u32>,
}

/// State shared by the run task, the supervisor and `stop_tests`.
struct RunShared {
    cancel: CancellationToken,
    log: LogSink,
    ui: Collaborators,
    /// Run task (or supervisor) still alive.
    outstanding: AtomicBool,
    stopped: AtomicBool,
    had_errors: AtomicBool,
    finalized: AtomicBool,
    iterations: Mutex<Vec<IterationReport>>,
    reset: Mutex<Option<ResetFn>>,
}

impl RunShared {
    fn new(log: LogSink, ui: Collaborators, outstanding: bool) -> Self {
        Self {
            cancel: CancellationToken::new(),
            log,
            ui,
            outstanding: AtomicBool::new(outstanding),
            stopped: AtomicBool::new(false),
            had_errors: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            iterations: Mutex::new(Vec::new()),
            reset: Mutex::new(None),
        }
    }

    fn outcome(&self) -> RunOutcome {
        if self.stopped.load(Ordering::Acquire) {
            RunOutcome::Stopped
        } else if self.had_errors.load(Ordering::Acquire) {
            RunOutcome::CompletedWithErrors
        } else {
            RunOutcome::Completed
        }
    }

    /// One-shot cleanup. Returns the outcome and created files, or `None`
    /// if an earlier call already finalized this run.
    async fn finalize(&self) -> Option<(RunOutcome, Vec<PathBuf>)> {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let outcome = self.outcome();
        self.log.append(format!("\n{outcome}"));

        let files = self.log.created_files().await;
        if files.is_empty() {
            self.log.append("No log files were created.");
        } else {
            self.log.append("Log files created:");
            for file in &files {
                self.log.append(format!("  {}", file.display()));
            }
        }
        self.log.flush().await;

        self.ui.timer.stop();
        self.ui.hooks.set_running(false);
        self.ui.hooks.on_test_complete();
        tracing::info!(?outcome, files = files.len(), "run finalized");

        self.run_reset();
        Some((outcome, files))
    }

    fn run_reset(&self) {
        let reset = lock(&self.reset).take();
        if let Some(reset) = reset {
            reset();
        }
    }

    fn record(&self, report: IterationReport) {
        if report.needs_backoff() {
            self.had_errors.store(true, Ordering::Release);
        }
        lock(&self.iterations).push(report);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct RunOrchestrator {
    engine: Arc<dyn ExecutionEngine>,
    ui: Collaborators,
    tuning: ControllerTuning,
    log_config: LogConfig,
    /// Current or most recent run. Before the first run this is an idle
    /// placeholder so that an early stop still finalizes once.
    current: Mutex<Arc<RunShared>>,
}

impl RunOrchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        ui: Collaborators,
        tuning: ControllerTuning,
        log_config: LogConfig,
    ) -> Self {
        let idle = RunShared::new(LogSink::presenter_only(ui.presenter.clone()), ui.clone(), false);
        Self {
            engine,
            ui,
            tuning,
            log_config,
            current: Mutex::new(Arc::new(idle)),
        }
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        lock(&self.current).outstanding.load(Ordering::SeqCst)
    }

    /// Start a run. Must be called from within a Tokio runtime.
    pub fn start_test(
        &self,
        args: TestArguments,
        config: IterationConfig,
    ) -> Result<RunHandle, LabError> {
        if args.is_empty() {
            return Err(LabError::EmptyArguments);
        }
        config.validate()?;

        let mut current = lock(&self.current);
        if current.outstanding.load(Ordering::SeqCst) {
            return Err(LabError::RunActive);
        }

        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let log = LogSink::spawn(&self.log_config, &timestamp, self.ui.presenter.clone());
        let shared = Arc::new(RunShared::new(log.clone(), self.ui.clone(), true));
        *current = shared.clone();
        drop(current);

        tracing::info!(
            iterations = config.iterations,
            duration_s = config.duration.as_secs(),
            strategy = ?config.strategy,
            auto_reduce = config.auto_reduce,
            command = %args,
            "starting run"
        );
        self.ui.timer.start();
        self.ui.hooks.set_running(true);

        let controller = IterationController::new(
            self.engine.clone(),
            self.ui.prompt.clone(),
            log,
            &config,
            self.tuning.clone(),
            args,
        );

        let run_task = tokio::spawn(run_loop(
            shared.clone(),
            controller,
            config,
            self.tuning.clone(),
        ));
        let supervisor = tokio::spawn(supervise(shared, run_task));

        Ok(RunHandle { supervisor })
    }

    /// Stop whatever is happening. Safe to call at any time, any number of
    /// times.
    pub async fn stop_tests(&self) {
        self.stop(None).await;
    }

    /// Stop, then run `reset` once finalization has finished. If the run
    /// was already finalized, `reset` runs right away.
    pub async fn stop_tests_then(&self, reset: impl FnOnce() + Send + 'static) {
        self.stop(Some(Box::new(reset))).await;
    }

    async fn stop(&self, reset: Option<ResetFn>) {
        let shared = lock(&self.current).clone();

        if let Some(reset) = reset {
            *lock(&shared.reset) = Some(reset);
        }

        // The reset is stored before this load; see `supervise`.
        let outstanding = shared.outstanding.load(Ordering::SeqCst);
        // Cancel before aborting: the iteration must resolve as stopped, not
        // as the completion the abort provokes.
        shared.stopped.store(true, Ordering::Release);
        shared.cancel.cancel();

        let sink = if outstanding {
            shared.log.append("\nStopping test...");
            forced_stop_sink(shared.log.clone())
        } else {
            detached_stop_sink()
        };
        self.engine.abort(sink);
        tracing::info!(outstanding, "stop requested");

        if !outstanding && shared.finalize().await.is_none() {
            // Already finalized: a late reset still runs.
            shared.run_reset();
        }
    }
}

/// Stop output when no run is outstanding goes to the diagnostic log only.
fn detached_stop_sink() -> Arc<dyn EngineSink> {
    CallbackSink::new()
        .on_line(|line| tracing::debug!(line, "engine output during idle stop"))
        .on_error(|error| tracing::debug!(error, "engine error during idle stop"))
        .into_sink()
}

/// Sleep unless the run is cancelled first. Returns `false` on cancel.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_loop(
    shared: Arc<RunShared>,
    mut controller: IterationController,
    config: IterationConfig,
    tuning: ControllerTuning,
) -> RunProgress {
    let cancel = shared.cancel.clone();
    let mut progress = RunProgress::default();

    if config.strategy.hybrid && !cancel.is_cancelled() {
        match controller.estimate_bandwidth(&cancel).await {
            Ok(estimate) => {
                controller.seed_bandwidth(estimate);
                progress.estimate = Some(estimate);
                shared.log.append(format!(
                    "Estimated bandwidth: {estimate}M. Switching to UDP at {estimate}M.\n\n[New command] {}",
                    controller.state().args
                ));
                tracing::info!(estimate_mbps = estimate, "hybrid estimation seeded bandwidth");
            }
            Err(IterationError::UserStop) => {}
            Err(e) => {
                shared.log.append(format!(
                    "Warning: {e}. Continuing with the original arguments."
                ));
                tracing::warn!(error = %e, "hybrid estimation failed");
            }
        }
    }

    let total = config.iterations;
    for index in 0..total as usize {
        if cancel.is_cancelled() {
            break;
        }

        let attempt = AssertUnwindSafe(controller.run_iteration(index, total, &cancel))
            .catch_unwind()
            .await;
        let report = match attempt {
            Ok(report) => report,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                shared.log.append(format!(
                    "\nUnexpected error in iteration {}: {msg}",
                    index + 1
                ));
                tracing::error!(iteration = index + 1, panic = %msg, "iteration panicked");
                IterationReport::panicked(index, &msg, controller.state())
            }
        };

        let failed = controller.state().last_iteration_had_error || report.needs_backoff();
        if failed {
            shared.had_errors.store(true, Ordering::Release);
        }
        shared.record(report);
        controller.clear_error_flag();

        if controller.state().was_stopped_manually || cancel.is_cancelled() {
            break;
        }
        if index + 1 == total as usize {
            break;
        }

        if failed {
            let backoff = tuning.error_backoff(config.duration);
            shared.log.append(format!(
                "Waiting {}s before the next iteration after an error...",
                backoff.as_secs()
            ));
            if !pause(&cancel, backoff).await {
                break;
            }
        }
        shared.log.append(format!(
            "Waiting {}s before the next iteration...",
            config.wait_time.as_secs()
        ));
        if !pause(&cancel, config.wait_time).await {
            break;
        }
    }

    if cancel.is_cancelled() {
        controller.mark_stopped();
    }
    let state = controller.state();
    progress.final_bandwidth = state.args.extract_bandwidth_mbps();
    progress.final_step = (config.strategy.smart_ramp_up
        || config.strategy.hybrid
        || state.was_auto_reduced_on_packet_loss)
        .then_some(state.current_step_bandwidth_mbps);
    progress
}

async fn supervise(shared: Arc<RunShared>, run_task: JoinHandle<RunProgress>) -> RunReport {
    let progress = match run_task.await {
        Ok(progress) => progress,
        Err(e) => {
            let reason = if e.is_panic() {
                panic_message(e.into_panic().as_ref())
            } else {
                "run task cancelled".to_string()
            };
            shared.had_errors.store(true, Ordering::Release);
            shared.log.append(format!("\nUnexpected error: {reason}"));
            tracing::error!(reason = %reason, "run task failed");
            RunProgress::default()
        }
    };

    let (outcome, created_files) = match shared.finalize().await {
        Some(done) => done,
        None => (shared.outcome(), shared.log.created_files().await),
    };
    shared.outstanding.store(false, Ordering::SeqCst);
    // A reset registered while finalize was already running.
    shared.run_reset();

    RunReport {
        outcome,
        iterations: std::mem::take(&mut *lock(&shared.iterations)),
        created_files,
        estimated_bandwidth_mbps: progress.estimate,
        final_bandwidth_mbps: progress.final_bandwidth,
        final_step_mbps: progress.final_step,
    }
}
