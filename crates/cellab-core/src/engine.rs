//! Execution engine contract and the callback adapter.
//!
//! The engine is the thing that actually runs iperf. It is injected into
//! the orchestrator once and shared by every iteration. A run delivers
//! zero or more `on_line` calls followed by one terminal `on_error` or
//! `on_complete`. `abort` asks for a best-effort stop; the engine still
//! reports the terminal callback on the run's own sink.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::args::TestArguments;

/// Receives engine output. Implementations must be callable from any thread.
pub trait EngineSink: Send + Sync {
    fn on_line(&self, line: &str);
    fn on_error(&self, error: &str);
    fn on_complete(&self);
}

/// A test-execution backend (a real `iperf3` process, a simulator, a fake).
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Run one test to completion.
    ///
    /// The future is spawned on the runtime. When `cancel` fires the engine
    /// should wind down at its next suspension point and return.
    fn run(
        &self,
        args: TestArguments,
        sink: Arc<dyn EngineSink>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()>;

    /// Request that the current run stop. Output produced by the stop itself
    /// goes to `sink`.
    fn abort(&self, sink: Arc<dyn EngineSink>);
}

type LineFn = Box<dyn Fn(&str) + Send + Sync>;
type DoneFn = Box<dyn Fn() + Send + Sync>;

/// Turns up to three independent closures into one [`EngineSink`].
/// Unset callbacks are no-ops.
#[derive(Default)]
pub struct CallbackSink {
    on_line: Option<LineFn>,
    on_error: Option<LineFn>,
    on_complete: Option<DoneFn>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_line(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_line = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn into_sink(self) -> Arc<dyn EngineSink> {
        Arc::new(self)
    }
}

impl EngineSink for CallbackSink {
    fn on_line(&self, line: &str) {
        if let Some(f) = &self.on_line {
            f(line);
        }
    }

    fn on_error(&self, error: &str) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    fn on_complete(&self) {
        if let Some(f) = &self.on_complete {
            f();
        }
    }
}
