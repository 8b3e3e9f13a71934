//! Iteration controller: runs one engine invocation at a time and owns the
//! run state that carries over between iterations.
//!
//! Per iteration:
//!
//! ```text
//! Preparing ──► Running ──► Completing | TimedOut | Stopped ──► Reconciled
//! ```
//!
//! - **Preparing** applies the ramp strategy to the argument list.
//! - **Running** spawns the engine task and a watchdog task. The engine
//!   callbacks, the watchdog and a stop request race to resolve one
//!   [`ResolveOnce`]; the first one wins and later signals are ignored.
//! - **Reconciled** always runs: loss-triggered reduction (time-boxed
//!   prompt), cancel-and-join of the engine task, then ramp evaluation.
//!
//! The engine task is always joined before the call returns, so two engine
//! runs never overlap and never write to the log sink at the same time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::args::{TestArguments, UDP_FLAG};
use crate::config::{ControllerTuning, IterationConfig, Strategy};
use crate::engine::{CallbackSink, EngineSink, ExecutionEngine};
use crate::error::IterationError;
use crate::log_sink::LogSink;
use crate::loss::PacketLossWindow;
use crate::ramp::RampDecision;
use crate::resolve::ResolveOnce;
use crate::telemetry::{parse_packet_loss_percent, parse_throughput_mbps};
use crate::ui::BandwidthPrompt;

// ── Run state ───────────────────────────────────────────────────────

/// State that lives for one run and is only touched by the controller.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Target bandwidth of the initial arguments (0 when absent). Upper
    /// bound for both ramp strategies.
    pub original_bandwidth_mbps: u32,
    /// Bandwidth the smart ramp is currently testing.
    pub current_step_bandwidth_mbps: u32,
    pub loss_window: PacketLossWindow,
    pub last_iteration_had_error: bool,
    pub was_auto_reduced_on_packet_loss: bool,
    pub was_stopped_manually: bool,
    /// Argument list for the next iteration.
    pub args: TestArguments,
}

impl RunState {
    pub fn new(args: TestArguments, tuning: &ControllerTuning) -> Self {
        Self {
            original_bandwidth_mbps: args.extract_bandwidth_mbps().unwrap_or(0),
            current_step_bandwidth_mbps: tuning.default_step_mbps,
            loss_window: PacketLossWindow::new(),
            last_iteration_had_error: false,
            was_auto_reduced_on_packet_loss: false,
            was_stopped_manually: false,
            args,
        }
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// How one engine invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum IterationOutcome {
    Completed,
    Errored(String),
    TimedOut,
    Stopped,
    /// The iteration itself panicked and was contained by the orchestrator.
    Panicked(String),
}

impl IterationOutcome {
    /// Error view of the outcome; `None` for a clean completion.
    pub fn error(&self, watchdog: Duration) -> Option<IterationError> {
        match self {
            IterationOutcome::Completed => None,
            IterationOutcome::Errored(msg) => Some(IterationError::Engine(msg.clone())),
            IterationOutcome::TimedOut => Some(IterationError::Timeout(watchdog)),
            IterationOutcome::Stopped => Some(IterationError::UserStop),
            IterationOutcome::Panicked(msg) => Some(IterationError::Panicked(msg.clone())),
        }
    }
}

/// What happened during one iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub index: usize,
    pub outcome: IterationOutcome,
    pub command: String,
    /// `-b` value the engine ran with.
    pub bandwidth_mbps: Option<u32>,
    pub max_throughput_mbps: u32,
    pub watchdog_ms: u64,
    pub loss_samples: Vec<f32>,
    /// A loss-triggered reduction was applied after this iteration.
    pub reduced: bool,
    /// Step bandwidth after reconciliation.
    pub next_step_mbps: u32,
}

impl IterationReport {
    /// Report for an iteration whose task panicked.
    pub fn panicked(index: usize, message: &str, state: &RunState) -> Self {
        Self {
            index,
            outcome: IterationOutcome::Panicked(message.to_string()),
            command: state.args.command_line(),
            bandwidth_mbps: state.args.extract_bandwidth_mbps(),
            max_throughput_mbps: 0,
            watchdog_ms: 0,
            loss_samples: Vec::new(),
            reduced: false,
            next_step_mbps: state.current_step_bandwidth_mbps,
        }
    }

    pub fn error(&self) -> Option<IterationError> {
        self.outcome
            .error(Duration::from_millis(self.watchdog_ms))
    }

    /// Whether the orchestrator should back off before the next iteration.
    pub fn needs_backoff(&self) -> bool {
        self.error().is_some_and(|e| e.needs_backoff())
    }
}

// ── Per-invocation shared state ─────────────────────────────────────

/// Written by engine callbacks (any thread), read by the controller.
struct Invocation {
    resolution: ResolveOnce<IterationOutcome>,
    max_throughput: AtomicU32,
    loss_samples: Mutex<Vec<f32>>,
    engine_error: AtomicBool,
    /// Signalled by the run sink's terminal callback, whoever won the race.
    ended: Notify,
}

impl Invocation {
    fn new() -> Self {
        Self {
            resolution: ResolveOnce::new(),
            max_throughput: AtomicU32::new(0),
            loss_samples: Mutex::new(Vec::new()),
            engine_error: AtomicBool::new(false),
            ended: Notify::new(),
        }
    }

    fn take_loss_samples(&self) -> Vec<f32> {
        match self.loss_samples.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

#[derive(Clone, Copy)]
enum Pass {
    Iteration { index: usize, total: u32 },
    Estimation,
}

impl Pass {
    fn label(self) -> String {
        match self {
            Pass::Iteration { index, total } => format!("iteration {}/{}", index + 1, total),
            Pass::Estimation => "estimation pass".to_string(),
        }
    }

    fn line_prefix(self) -> &'static str {
        match self {
            Pass::Iteration { .. } => "| ",
            Pass::Estimation => "~ ",
        }
    }
}

/// Engine task that is cancelled and aborted if dropped before being joined.
struct EngineTask {
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Drop for EngineTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.cancel();
            handle.abort();
        }
    }
}

/// A launched engine invocation.
struct Launched {
    invocation: Arc<Invocation>,
    task: EngineTask,
    watchdog_disarm: CancellationToken,
    watchdog: Duration,
}

// ── Controller ──────────────────────────────────────────────────────

pub struct IterationController {
    engine: Arc<dyn ExecutionEngine>,
    prompt: Arc<dyn BandwidthPrompt>,
    log: LogSink,
    tuning: ControllerTuning,
    strategy: Strategy,
    auto_reduce: bool,
    duration: Duration,
    state: RunState,
}

impl IterationController {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        prompt: Arc<dyn BandwidthPrompt>,
        log: LogSink,
        config: &IterationConfig,
        tuning: ControllerTuning,
        args: TestArguments,
    ) -> Self {
        let state = RunState::new(args, &tuning);
        Self {
            engine,
            prompt,
            log,
            tuning,
            strategy: config.strategy,
            auto_reduce: config.auto_reduce,
            duration: config.duration,
            state,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Watchdog period for one invocation.
    pub fn watchdog_timeout(&self) -> Duration {
        self.tuning.watchdog_timeout(self.duration)
    }

    /// Consume the error flag after the backoff decision.
    pub fn clear_error_flag(&mut self) {
        self.state.last_iteration_had_error = false;
    }

    pub fn mark_stopped(&mut self) {
        self.state.was_stopped_manually = true;
    }

    /// Run one iteration end to end. Always joins the engine task before
    /// returning.
    pub async fn run_iteration(
        &mut self,
        index: usize,
        total: u32,
        cancel: &CancellationToken,
    ) -> IterationReport {
        let pass = Pass::Iteration { index, total };

        // ── Preparing ──
        let args = self.prepare(index);
        let now = chrono::Local::now().format("%H:%M:%S");
        self.log.append(format!(
            "\n[{now}] ── Starting iperf3 test {}/{} ──\n\n{args}\n",
            index + 1,
            total
        ));
        tracing::info!(iteration = index + 1, total, command = %args, "starting iteration");

        // ── Running ──
        let is_udp = args.is_udp();
        let launched = self.launch(&args, pass, self.strategy.smart_ramp_up, cancel);
        let watchdog = launched.watchdog;
        let outcome = self.await_resolution(&launched, cancel).await;
        let stopped = outcome == IterationOutcome::Stopped || cancel.is_cancelled();

        match &outcome {
            IterationOutcome::Completed => {}
            IterationOutcome::Errored(msg) => {
                tracing::warn!(iteration = index + 1, error = %msg, "iteration failed");
            }
            IterationOutcome::TimedOut => {
                tracing::warn!(
                    iteration = index + 1,
                    watchdog_s = watchdog.as_secs(),
                    "iteration timed out"
                );
            }
            IterationOutcome::Stopped => {
                self.log
                    .append(format!("Iteration {} interrupted by stop request.", index + 1));
            }
            IterationOutcome::Panicked(_) => {}
        }
        if stopped {
            self.state.was_stopped_manually = true;
        }

        // ── Reconciled ──
        let mut seen_samples = self.absorb_loss_samples(&launched.invocation);

        let mut reduced = false;
        if self.auto_reduce && !stopped && self.high_loss() {
            reduced = self.offer_reduction(cancel).await;
        }

        let invocation = launched.invocation.clone();
        let settle = outcome == IterationOutcome::TimedOut;
        self.join(launched, pass, settle).await;
        seen_samples.extend(self.absorb_loss_samples(&invocation));

        let engine_error = invocation.engine_error.load(Ordering::Acquire);
        let failed = outcome
            .error(watchdog)
            .is_some_and(|e| e.needs_backoff());
        self.state.last_iteration_had_error = failed || engine_error;

        if is_udp && seen_samples.is_empty() && !self.state.last_iteration_had_error && !stopped {
            self.log
                .append("No packet loss stats detected in this run.");
        }

        let max_throughput = invocation.max_throughput.load(Ordering::Acquire);
        // Runs against the reduced step when a reduction was just applied.
        if (self.strategy.smart_ramp_up || self.state.was_auto_reduced_on_packet_loss)
            && !self.state.last_iteration_had_error
            && !stopped
        {
            self.evaluate_ramp(index, max_throughput);
        }

        IterationReport {
            index,
            outcome,
            command: args.command_line(),
            bandwidth_mbps: args.extract_bandwidth_mbps(),
            max_throughput_mbps: max_throughput,
            watchdog_ms: watchdog.as_millis() as u64,
            loss_samples: seen_samples,
            reduced,
            next_step_mbps: self.state.current_step_bandwidth_mbps,
        }
    }

    /// Hybrid pre-pass: run the TCP bidirectional variant and report the
    /// highest throughput seen.
    pub async fn estimate_bandwidth(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<u32, IterationError> {
        let (tcp_args, removed) = self.state.args.tcp_estimation_variant();
        if !removed.is_empty() {
            self.log.append(format!(
                "\n[TCP bidir prep] Removed incompatible flags: {}",
                removed.join(", ")
            ));
        }
        self.log.append(format!(
            "\n[TCP bidir prep] Temporary command for bandwidth estimation:\n\n{tcp_args}\n"
        ));

        let launched = self.launch(&tcp_args, Pass::Estimation, true, cancel);
        let outcome = self.await_resolution(&launched, cancel).await;
        let invocation = launched.invocation.clone();
        let settle = outcome == IterationOutcome::TimedOut;
        self.join(launched, Pass::Estimation, settle).await;
        // Estimation loss samples are not part of the UDP history.
        invocation.take_loss_samples();

        if outcome == IterationOutcome::Stopped {
            self.state.was_stopped_manually = true;
            return Err(IterationError::UserStop);
        }
        let max = invocation.max_throughput.load(Ordering::Acquire);
        tracing::info!(?outcome, max_throughput_mbps = max, "estimation pass finished");
        if max > 0 {
            Ok(max)
        } else {
            Err(IterationError::EstimationFailure)
        }
    }

    /// Seed the run with an estimated ceiling: UDP at the estimate.
    pub fn seed_bandwidth(&mut self, mbps: u32) {
        self.state.args = self.state.args.with_bandwidth(mbps).with_flag(UDP_FLAG);
        self.state.current_step_bandwidth_mbps = mbps;
    }

    // ── Preparing ───────────────────────────────────────────────────

    fn prepare(&mut self, index: usize) -> TestArguments {
        let mut args = self.state.args.clone();

        if self.strategy.incremental_ramp_up {
            let target = args.extract_bandwidth_mbps();
            match self
                .tuning
                .ramp
                .incremental(index, target, self.state.original_bandwidth_mbps)
            {
                Some(bw) => {
                    args = args.with_bandwidth(bw);
                    self.log.append(format!("Ramp-up bandwidth set to {bw}M"));
                }
                None => {
                    self.log
                        .append("Bandwidth too low for ramp-up. Skipping ramp logic.");
                }
            }
        }

        if self.strategy.smart_ramp_up {
            let bw = self.state.current_step_bandwidth_mbps;
            args = args.with_bandwidth(bw);
            self.log.append(format!("\nSet bandwidth: {bw}M"));
            self.log.append(format!("[New command] {args}"));
        }

        self.state.args = args.clone();
        args
    }

    // ── Running ─────────────────────────────────────────────────────

    fn launch(
        &self,
        args: &TestArguments,
        pass: Pass,
        track_throughput: bool,
        cancel: &CancellationToken,
    ) -> Launched {
        let invocation = Arc::new(Invocation::new());
        let sink = self.invocation_sink(&invocation, pass, track_throughput, args.is_udp());

        let engine_cancel = cancel.child_token();
        let handle = tokio::spawn(self.engine.run(args.clone(), sink, engine_cancel.clone()));

        let watchdog = self.watchdog_timeout();
        let watchdog_disarm = cancel.child_token();
        tokio::spawn(watchdog_task(
            invocation.clone(),
            self.engine.clone(),
            self.log.clone(),
            watchdog,
            pass.label(),
            watchdog_disarm.clone(),
        ));

        Launched {
            invocation,
            task: EngineTask {
                handle: Some(handle),
                cancel: engine_cancel,
            },
            watchdog_disarm,
            watchdog,
        }
    }

    fn invocation_sink(
        &self,
        invocation: &Arc<Invocation>,
        pass: Pass,
        track_throughput: bool,
        is_udp: bool,
    ) -> Arc<dyn EngineSink> {
        let prefix = pass.line_prefix();
        let label = pass.label();

        let line_log = self.log.clone();
        let line_inv = invocation.clone();
        let error_log = self.log.clone();
        let error_inv = invocation.clone();
        let error_label = label.clone();
        let done_log = self.log.clone();
        let done_inv = invocation.clone();

        CallbackSink::new()
            .on_line(move |line| {
                line_log.append(format!("{prefix}{line}"));
                if track_throughput {
                    if let Some(mbps) = parse_throughput_mbps(line) {
                        line_inv.max_throughput.fetch_max(mbps, Ordering::AcqRel);
                    }
                }
                if is_udp {
                    if let Some(loss) = parse_packet_loss_percent(line) {
                        match line_inv.loss_samples.lock() {
                            Ok(mut samples) => samples.push(loss),
                            Err(poisoned) => poisoned.into_inner().push(loss),
                        }
                    }
                }
            })
            .on_error(move |error| {
                error_log.append(format!("\nError ({error_label}): {error}"));
                error_inv.engine_error.store(true, Ordering::Release);
                error_inv
                    .resolution
                    .resolve(IterationOutcome::Errored(error.to_string()));
                error_inv.ended.notify_one();
            })
            .on_complete(move || {
                let label = match pass {
                    Pass::Iteration { index, .. } => format!("\n[End] Iteration {}", index + 1),
                    Pass::Estimation => "TCP bidir test complete.\n".to_string(),
                };
                done_log.append(label);
                done_inv.resolution.resolve(IterationOutcome::Completed);
                done_inv.ended.notify_one();
            })
            .into_sink()
    }

    /// Wait until the engine, the watchdog or a stop request resolves the
    /// invocation. Bounded by the watchdog.
    async fn await_resolution(
        &self,
        launched: &Launched,
        cancel: &CancellationToken,
    ) -> IterationOutcome {
        let resolution = &launched.invocation.resolution;
        let outcome = tokio::select! {
            outcome = resolution.wait() => outcome,
            _ = cancel.cancelled() => {
                resolution.resolve(IterationOutcome::Stopped);
                resolution.wait().await
            }
        };
        launched.watchdog_disarm.cancel();
        outcome
    }

    // ── Reconciled ──────────────────────────────────────────────────

    /// Move this invocation's loss samples into the run window, in order.
    fn absorb_loss_samples(&mut self, invocation: &Invocation) -> Vec<f32> {
        let samples = invocation.take_loss_samples();
        for &sample in &samples {
            self.state.loss_window.push(sample);
        }
        samples
    }

    fn high_loss(&self) -> bool {
        self.state
            .loss_window
            .is_high_loss(self.tuning.loss_threshold, self.tuning.loss_required)
    }

    /// Ask whether to reduce; apply the reduction on yes or silence.
    /// Returns whether a reduction was applied.
    async fn offer_reduction(&mut self, cancel: &CancellationToken) -> bool {
        let countdown = self.tuning.decision_countdown;
        self.log.append(format!(
            "High packet loss in the last {} intervals. Reduce bandwidth? (auto-confirming in {}s)",
            self.state.loss_window.len(),
            countdown.as_secs()
        ));

        let (tx, rx) = oneshot::channel();
        self.prompt.ask(Box::new(move |decision| {
            let _ = tx.send(decision);
        }));

        let decision = tokio::select! {
            answer = rx => answer.unwrap_or(true),
            _ = tokio::time::sleep(countdown) => {
                self.log.append(format!("No answer within {}s, reducing bandwidth.", countdown.as_secs()));
                true
            }
            _ = cancel.cancelled() => return false,
        };

        if !decision {
            self.log
                .append("High packet loss ignored. Keeping current bandwidth.");
            tracing::info!("loss-triggered reduction declined");
            return false;
        }

        let from = self.state.current_step_bandwidth_mbps;
        let to = self.tuning.reduced_step(from);
        self.state.current_step_bandwidth_mbps = to;
        self.state.args = self.state.args.with_bandwidth(to);
        self.state.was_auto_reduced_on_packet_loss = true;
        self.log.append(format!(
            "High packet loss detected. Reduced bandwidth to {to}M."
        ));
        tracing::info!(from_mbps = from, to_mbps = to, "bandwidth reduced on packet loss");
        true
    }

    /// Cancel the engine task and wait for it to stop. A task that ignores
    /// cancellation for longer than the drain grace is aborted, then joined.
    ///
    /// With `settle`, the engine has been asked to abort and first gets up
    /// to the drain grace to report its own ending, so the output it
    /// produces while stopping still reaches the log.
    async fn join(&self, mut launched: Launched, pass: Pass, settle: bool) {
        let Some(mut handle) = launched.task.handle.take() else {
            return;
        };
        let cancel = launched.task.cancel.clone();
        let grace = self.tuning.drain_grace;
        let waiting_on_stop = cancel.is_cancelled();

        if waiting_on_stop {
            self.log.append("\nWaiting for iperf to finish cleanup...");
        }

        let mut joined = None;
        if settle && !waiting_on_stop {
            let ended = &launched.invocation.ended;
            let settled = tokio::time::timeout(grace, async {
                tokio::select! {
                    res = &mut handle => Some(res),
                    _ = ended.notified() => None,
                }
            })
            .await;
            match settled {
                Ok(Some(res)) => joined = Some(res),
                Ok(None) => {}
                Err(_) => tracing::debug!(
                    grace_ms = grace.as_millis() as u64,
                    "engine still running after abort, cancelling"
                ),
            }
        }

        let joined = match joined {
            Some(res) => Some(res),
            None => {
                cancel.cancel();
                tokio::time::timeout(grace, &mut handle).await.ok()
            }
        };

        match joined {
            Some(Ok(())) => {}
            Some(Err(e)) if e.is_panic() => {
                launched.invocation.engine_error.store(true, Ordering::Release);
                self.log
                    .append(format!("Engine task panicked during the {}.", pass.label()));
                tracing::error!(error = %e, "engine task panicked");
            }
            Some(Err(_)) => {}
            None => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "engine task ignored cancellation, aborting"
                );
                self.log.append(format!(
                    "Engine did not stop within {}s, abandoning the {}.",
                    grace.as_secs(),
                    pass.label()
                ));
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    fn evaluate_ramp(&mut self, index: usize, max_achieved: u32) {
        let decision = self.tuning.ramp.evaluate(
            self.state.current_step_bandwidth_mbps,
            index,
            max_achieved,
            self.state.original_bandwidth_mbps,
        );
        match decision {
            RampDecision::Increase { from, to } => {
                self.log.append(format!(
                    "\nSmart ramp-up: achieved {max_achieved}M, increasing bandwidth {from}M -> {to}M."
                ));
            }
            RampDecision::Hold(bw) => {
                self.log.append(format!("Holding bandwidth at {bw}M."));
            }
        }
        self.state.current_step_bandwidth_mbps = decision.bandwidth();
    }
}

/// Fires once the watchdog period elapses unless disarmed first.
async fn watchdog_task(
    invocation: Arc<Invocation>,
    engine: Arc<dyn ExecutionEngine>,
    log: LogSink,
    timeout: Duration,
    label: String,
    disarm: CancellationToken,
) {
    tokio::select! {
        _ = disarm.cancelled() => {}
        _ = tokio::time::sleep(timeout) => {
            if invocation.resolution.resolve(IterationOutcome::TimedOut) {
                log.append(format!(
                    "Timeout: iperf did not respond for {label} within {}s. Forcing stop.",
                    timeout.as_secs()
                ));
                engine.abort(forced_stop_sink(log));
            }
        }
    }
}

/// Sink for output produced by a forced stop.
pub(crate) fn forced_stop_sink(log: LogSink) -> Arc<dyn EngineSink> {
    let error_log = log.clone();
    CallbackSink::new()
        .on_line(move |line| log.append(format!("> {line}")))
        .on_error(move |error| error_log.append(format!("\nError while stopping: {error}")))
        .into_sink()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;
    use tokio::sync::Notify;

    use crate::ui::{DecisionFn, FixedDecision, Headless, Presenter};

    enum End {
        Complete,
        Error(&'static str),
        Hang,
        /// Like `Hang`, but prints a late summary before completing.
        HangThenSummary,
    }

    struct Script {
        lines: Vec<String>,
        end: End,
    }

    impl Script {
        fn complete(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                end: End::Complete,
            }
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        scripts: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<TestArguments>>,
        aborts: AtomicUsize,
        abort_signal: Arc<Notify>,
    }

    impl FakeEngine {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }
    }

    impl ExecutionEngine for FakeEngine {
        fn run(
            &self,
            args: TestArguments,
            sink: Arc<dyn EngineSink>,
            cancel: CancellationToken,
        ) -> futures::future::BoxFuture<'static, ()> {
            self.calls.lock().unwrap().push(args);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Script::complete(&[]));
            let abort_signal = self.abort_signal.clone();
            async move {
                for line in script.lines {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => return,
                    }
                    sink.on_line(&line);
                }
                match script.end {
                    End::Complete => sink.on_complete(),
                    End::Error(msg) => sink.on_error(msg),
                    End::Hang => {
                        tokio::select! {
                            _ = abort_signal.notified() => sink.on_complete(),
                            _ = cancel.cancelled() => {}
                        }
                    }
                    End::HangThenSummary => {
                        tokio::select! {
                            _ = abort_signal.notified() => {}
                            _ = cancel.cancelled() => return,
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                            _ = cancel.cancelled() => return,
                        }
                        sink.on_line("INTERRUPT SUMMARY");
                        sink.on_complete();
                    }
                }
            }
            .boxed()
        }

        fn abort(&self, sink: Arc<dyn EngineSink>) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            sink.on_line("iperf3: interrupt - the client has terminated");
            self.abort_signal.notify_one();
        }
    }

    #[derive(Default)]
    struct CountingPrompt {
        asked: AtomicUsize,
    }

    impl BandwidthPrompt for CountingPrompt {
        fn ask(&self, on_decision: DecisionFn) {
            self.asked.fetch_add(1, Ordering::SeqCst);
            on_decision(true);
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Presenter for Recorder {
        fn show(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    fn controller(
        engine: Arc<FakeEngine>,
        prompt: Arc<dyn BandwidthPrompt>,
        command: &str,
        strategy: Strategy,
        auto_reduce: bool,
    ) -> IterationController {
        controller_showing(engine, prompt, command, strategy, auto_reduce, Arc::new(Headless))
    }

    fn controller_showing(
        engine: Arc<FakeEngine>,
        prompt: Arc<dyn BandwidthPrompt>,
        command: &str,
        strategy: Strategy,
        auto_reduce: bool,
        presenter: Arc<dyn Presenter>,
    ) -> IterationController {
        let args = TestArguments::parse_command(command);
        let config = IterationConfig::for_args(&args, 3, Duration::from_secs(5))
            .with_strategy(strategy)
            .with_auto_reduce(auto_reduce);
        IterationController::new(
            engine,
            prompt,
            LogSink::presenter_only(presenter),
            &config,
            ControllerTuning::default(),
            args,
        )
    }

    fn smart() -> Strategy {
        Strategy {
            smart_ramp_up: true,
            ..Default::default()
        }
    }

    fn rate_line(mbps: &str) -> String {
        format!("[  5]   0.00-1.00   sec  5.50 MBytes  {mbps} Mbits/sec")
    }

    #[tokio::test(start_paused = true)]
    async fn smart_ramp_increases_at_ninety_percent() {
        let engine = FakeEngine::with(vec![Script::complete(&[&rate_line("46")])]);
        let mut ctl = controller(
            engine.clone(),
            Arc::new(FixedDecision(true)),
            "-c h -u -b 500M -t 10",
            smart(),
            false,
        );

        let report = ctl.run_iteration(0, 3, &CancellationToken::new()).await;

        assert_eq!(report.outcome, IterationOutcome::Completed);
        assert_eq!(report.bandwidth_mbps, Some(50));
        assert_eq!(report.max_throughput_mbps, 46);
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 100);
        assert_eq!(
            engine.calls.lock().unwrap()[0].extract_bandwidth_mbps(),
            Some(50)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn smart_ramp_holds_below_ninety_percent() {
        let engine = FakeEngine::with(vec![Script::complete(&[&rate_line("44")])]);
        let mut ctl = controller(
            engine,
            Arc::new(FixedDecision(true)),
            "-c h -u -b 500M",
            smart(),
            false,
        );

        ctl.run_iteration(0, 3, &CancellationToken::new()).await;
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_ramp_rewrites_bandwidth() {
        let engine = FakeEngine::with(vec![]);
        let strategy = Strategy {
            incremental_ramp_up: true,
            ..Default::default()
        };
        let mut ctl = controller(
            engine.clone(),
            Arc::new(FixedDecision(true)),
            "-c h -u -b 120M",
            strategy,
            false,
        );

        let token = CancellationToken::new();
        for i in 0..3 {
            ctl.run_iteration(i, 3, &token).await;
        }
        let sent: Vec<_> = engine
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.extract_bandwidth_mbps())
            .collect();
        assert_eq!(sent, vec![Some(50), Some(100), Some(120)]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_engine_times_out_and_is_aborted() {
        let engine = FakeEngine::with(vec![Script {
            lines: vec![],
            end: End::Hang,
        }]);
        let mut ctl = controller(
            engine.clone(),
            Arc::new(FixedDecision(true)),
            "-c h -t 10",
            Strategy::default(),
            false,
        );

        let started = tokio::time::Instant::now();
        let report = ctl.run_iteration(0, 1, &CancellationToken::new()).await;

        assert_eq!(report.outcome, IterationOutcome::TimedOut);
        assert_eq!(report.watchdog_ms, 25_000);
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert_eq!(engine.aborts.load(Ordering::SeqCst), 1);
        assert!(ctl.state().last_iteration_had_error);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_engine_output_is_drained_before_cancel() {
        let engine = FakeEngine::with(vec![Script {
            lines: vec![],
            end: End::HangThenSummary,
        }]);
        let recorder = Arc::new(Recorder::default());
        let mut ctl = controller_showing(
            engine.clone(),
            Arc::new(FixedDecision(true)),
            "-c h -t 10",
            Strategy::default(),
            false,
            recorder.clone(),
        );

        let report = ctl.run_iteration(0, 1, &CancellationToken::new()).await;
        ctl.log.flush().await;

        assert_eq!(report.outcome, IterationOutcome::TimedOut);
        assert!(report.needs_backoff());
        let shown = recorder.0.lock().unwrap();
        assert!(shown.iter().any(|l| l == "| INTERRUPT SUMMARY"));
        assert!(!shown.iter().any(|l| l.starts_with("Engine did not stop")));
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_sets_flag_and_skips_ramp() {
        let engine = FakeEngine::with(vec![Script {
            lines: vec![rate_line("50")],
            end: End::Error("unable to connect to server"),
        }]);
        let mut ctl = controller(
            engine,
            Arc::new(FixedDecision(true)),
            "-c h -u -b 500M",
            smart(),
            false,
        );

        let report = ctl.run_iteration(0, 2, &CancellationToken::new()).await;
        assert_eq!(
            report.outcome,
            IterationOutcome::Errored("unable to connect to server".into())
        );
        assert!(ctl.state().last_iteration_had_error);
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 50);

        ctl.clear_error_flag();
        assert!(!ctl.state().last_iteration_had_error);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_loss_prompts_once_and_reduces() {
        let engine = FakeEngine::with(vec![Script::complete(&[
            "[  5] 0.00-1.00 sec 1.2 MBytes 10.0 Mbits/sec 0.1 ms 80/100 (80%)",
            "[  5] 1.00-2.00 sec 1.2 MBytes 10.0 Mbits/sec 0.1 ms 90/100 (90%)",
            "[  5] 2.00-3.00 sec 1.2 MBytes 10.0 Mbits/sec 0.1 ms 10/100 (10%)",
        ])]);
        let prompt = Arc::new(CountingPrompt::default());
        let mut ctl = controller(
            engine,
            prompt.clone(),
            "-c h -u -b 500M",
            smart(),
            true,
        );

        let report = ctl.run_iteration(0, 2, &CancellationToken::new()).await;

        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        assert!(report.reduced);
        assert_eq!(report.loss_samples, vec![80.0, 90.0, 10.0]);
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 40);
        assert!(ctl.state().was_auto_reduced_on_packet_loss);
        assert_eq!(ctl.state().args.extract_bandwidth_mbps(), Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_runs_against_the_reduced_step() {
        let engine = FakeEngine::with(vec![Script::complete(&[
            "[  5] 0.00-1.00 sec 6.0 MBytes 50.0 Mbits/sec 0.1 ms 80/100 (80%)",
            "[  5] 1.00-2.00 sec 6.0 MBytes 50.0 Mbits/sec 0.1 ms 90/100 (90%)",
            "[  5] 2.00-3.00 sec 6.0 MBytes 50.0 Mbits/sec 0.1 ms 10/100 (10%)",
        ])]);
        let prompt = Arc::new(CountingPrompt::default());
        let mut ctl = controller(engine, prompt.clone(), "-c h -u -b 500M", smart(), true);

        let report = ctl.run_iteration(0, 3, &CancellationToken::new()).await;

        // 50 is reduced to 40, then 50 achieved against 40 steps up to 90.
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
        assert!(report.reduced);
        assert_eq!(report.max_throughput_mbps, 50);
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 90);
        assert_eq!(report.next_step_mbps, 90);
    }

    #[tokio::test(start_paused = true)]
    async fn loss_is_ignored_without_udp() {
        let engine = FakeEngine::with(vec![Script::complete(&[
            "x (80%)", "x (90%)", "x (95%)",
        ])]);
        let prompt = Arc::new(CountingPrompt::default());
        let mut ctl = controller(engine, prompt.clone(), "-c h", Strategy::default(), true);

        let report = ctl.run_iteration(0, 1, &CancellationToken::new()).await;
        assert!(report.loss_samples.is_empty());
        assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);
    }

    struct SilentPrompt;

    impl BandwidthPrompt for SilentPrompt {
        fn ask(&self, on_decision: DecisionFn) {
            // Never answers; the controller's countdown decides.
            std::mem::forget(on_decision);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_prompt_reduces_after_countdown() {
        let engine = FakeEngine::with(vec![Script::complete(&[
            "(99%)", "(99%)", "(99%)",
        ])]);
        let mut ctl = controller(
            engine,
            Arc::new(SilentPrompt),
            "-c h -u -b 100M",
            smart(),
            true,
        );

        let started = tokio::time::Instant::now();
        let report = ctl.run_iteration(0, 1, &CancellationToken::new()).await;
        assert!(report.reduced);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_resolves_as_stopped() {
        let engine = FakeEngine::with(vec![Script {
            lines: vec![],
            end: End::Hang,
        }]);
        let mut ctl = controller(
            engine,
            Arc::new(FixedDecision(true)),
            "-c h -t 10",
            Strategy::default(),
            false,
        );

        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stopper.cancel();
        });

        let started = tokio::time::Instant::now();
        let report = ctl.run_iteration(0, 1, &token).await;
        assert_eq!(report.outcome, IterationOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(25));
        assert!(!ctl.state().last_iteration_had_error);
        assert!(ctl.state().was_stopped_manually);
        assert!(!report.needs_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn estimation_runs_tcp_variant_and_seeds() {
        let engine = FakeEngine::with(vec![Script::complete(&[
            &rate_line("120"),
            &rate_line("310.5"),
            &rate_line("290"),
        ])]);
        let strategy = Strategy {
            hybrid: true,
            ..Default::default()
        };
        let mut ctl = controller(
            engine.clone(),
            Arc::new(FixedDecision(true)),
            "-c h -u -b 50M -R -t 10",
            strategy,
            false,
        );

        let estimate = ctl.estimate_bandwidth(&CancellationToken::new()).await;
        assert_eq!(estimate, Ok(310));

        let tcp = engine.calls.lock().unwrap()[0].clone();
        assert!(!tcp.is_udp());
        assert!(tcp.contains("--bidir"));
        assert!(!tcp.contains("-R"));

        ctl.seed_bandwidth(310);
        assert!(ctl.state().args.is_udp());
        assert_eq!(ctl.state().args.extract_bandwidth_mbps(), Some(310));
        assert_eq!(ctl.state().current_step_bandwidth_mbps, 310);
    }

    #[tokio::test(start_paused = true)]
    async fn estimation_without_throughput_fails() {
        let engine = FakeEngine::with(vec![Script::complete(&["Connecting to host h"])]);
        let mut ctl = controller(
            engine,
            Arc::new(FixedDecision(true)),
            "-c h -u -b 50M",
            Strategy::default(),
            false,
        );
        assert_eq!(
            ctl.estimate_bandwidth(&CancellationToken::new()).await,
            Err(IterationError::EstimationFailure)
        );
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(IterationOutcome::Errored("refused".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "errored", "message": "refused"}));
        let json = serde_json::to_value(IterationOutcome::TimedOut).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "timed_out"}));
        let json = serde_json::to_value(IterationOutcome::Panicked("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "panicked", "message": "boom"}));
    }

    #[test]
    fn panicked_outcome_maps_to_error_with_backoff() {
        let outcome = IterationOutcome::Panicked("boom".into());
        let err = outcome.error(Duration::from_secs(25)).unwrap();
        assert_eq!(err, IterationError::Panicked("boom".into()));
        assert!(err.needs_backoff());
        assert_eq!(IterationOutcome::Completed.error(Duration::from_secs(25)), None);
    }
}
