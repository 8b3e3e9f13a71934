//! Scripted engine and recording collaborators shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellab_core::config::{ControllerTuning, LogConfig};
use cellab_core::ui::{
    BandwidthPrompt, Collaborators, DecisionFn, Presenter, RunHooks, TimerDisplay,
};
use cellab_core::{EngineSink, ExecutionEngine, RunOrchestrator, TestArguments};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ─── Scripted engine ────────────────────────────────────────────────────

pub enum End {
    Complete,
    Error(String),
    /// No terminal callback until aborted.
    Hang,
}

/// One engine run: lines one second apart, then the terminal behaviour.
pub struct Script {
    pub lines: Vec<String>,
    pub end: End,
}

impl Script {
    pub fn complete(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            end: End::Complete,
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            lines: Vec::new(),
            end: End::Error(msg.to_string()),
        }
    }

    pub fn hang() -> Self {
        Self {
            lines: Vec::new(),
            end: End::Hang,
        }
    }
}

pub struct ScriptedEngine {
    scripts: Mutex<VecDeque<Script>>,
    pub calls: Mutex<Vec<TestArguments>>,
    pub aborts: AtomicUsize,
    abort_tx: watch::Sender<u64>,
}

impl ScriptedEngine {
    /// Runs beyond the script complete after one silent second.
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        let (abort_tx, _) = watch::channel(0);
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: Mutex::new(Vec::new()),
            aborts: AtomicUsize::new(0),
            abort_tx,
        })
    }

    pub fn calls(&self) -> Vec<TestArguments> {
        self.calls.lock().unwrap().clone()
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl ExecutionEngine for ScriptedEngine {
    fn run(
        &self,
        args: TestArguments,
        sink: Arc<dyn EngineSink>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        self.calls.lock().unwrap().push(args);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::complete(&["[  5]   0.00-1.00   sec  1.0 MBytes  8.0 Mbits/sec"]));
        let mut aborted = self.abort_tx.subscribe();

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
                End::Error(msg) => sink.on_error(&msg),
                End::Hang => {
                    tokio::select! {
                        Ok(()) = aborted.changed() => {
                            sink.on_line("iperf3: interrupt - the client has terminated");
                            sink.on_complete();
                        }
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
        .boxed()
    }

    fn abort(&self, sink: Arc<dyn EngineSink>) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        sink.on_line("abort requested");
        self.abort_tx.send_modify(|n| *n += 1);
    }
}

// ─── Recording collaborators ────────────────────────────────────────────

/// Records everything the controller shows or triggers.
pub struct Recorder {
    pub shown: Mutex<Vec<String>>,
    pub events: Mutex<Vec<String>>,
    pub completes: AtomicUsize,
    pub asked: AtomicUsize,
    answer: bool,
}

impl Recorder {
    pub fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            shown: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            completes: AtomicUsize::new(0),
            asked: AtomicUsize::new(0),
            answer,
        })
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            presenter: self.clone(),
            timer: self.clone(),
            prompt: self.clone(),
            hooks: self.clone(),
        }
    }

    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }

    /// Number of shown records containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.shown
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn event(&self, e: &str) {
        self.events.lock().unwrap().push(e.to_string());
    }
}

impl Presenter for Recorder {
    fn show(&self, text: &str) {
        self.shown.lock().unwrap().push(text.to_string());
    }
}

impl TimerDisplay for Recorder {
    fn start(&self) {
        self.event("timer:start");
    }

    fn stop(&self) {
        self.event("timer:stop");
    }
}

impl BandwidthPrompt for Recorder {
    fn ask(&self, on_decision: DecisionFn) {
        self.asked.fetch_add(1, Ordering::SeqCst);
        on_decision(self.answer);
    }
}

impl RunHooks for Recorder {
    fn set_running(&self, running: bool) {
        self.event(&format!("running:{running}"));
    }

    fn on_test_complete(&self) {
        self.completes.fetch_add(1, Ordering::SeqCst);
        self.event("complete");
    }
}

// ─── Builders ───────────────────────────────────────────────────────────

pub fn orchestrator(
    engine: Arc<ScriptedEngine>,
    ui: Collaborators,
    log_dir: Option<&Path>,
) -> RunOrchestrator {
    init_tracing();
    let log = LogConfig {
        dir: log_dir.map(Path::to_path_buf),
        ..Default::default()
    };
    RunOrchestrator::new(engine, ui, ControllerTuning::default(), log)
}

/// `RUST_LOG=debug cargo test` shows the controller's diagnostics.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn rate_line(mbps: u32) -> String {
    format!("[  5]   0.00-1.00   sec  5.50 MBytes  {mbps} Mbits/sec")
}

pub fn loss_line(percent: u32) -> String {
    format!("[  5]   0.00-1.00   sec  1.19 MBytes  10.0 Mbits/sec  0.050 ms  {percent}/100 ({percent}%)")
}
