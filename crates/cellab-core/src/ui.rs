//! Presentation collaborators.
//!
//! The controller never renders anything itself; it calls these traits.
//! A terminal front-end, a GUI or a test recorder can sit behind them.

use std::sync::Arc;

/// Shows controller output (already mirrored to the log files).
pub trait Presenter: Send + Sync {
    fn show(&self, text: &str);
}

/// Elapsed-time display. The controller never reads the elapsed time.
pub trait TimerDisplay: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Callback handed to a [`BandwidthPrompt`].
pub type DecisionFn = Box<dyn FnOnce(bool) + Send>;

/// Asks whether to reduce bandwidth after sustained high loss.
///
/// The prompt may auto-resolve on its own countdown; the controller also
/// time-boxes the question and treats silence as "yes".
pub trait BandwidthPrompt: Send + Sync {
    fn ask(&self, on_decision: DecisionFn);
}

/// Enablement and completion hooks for the surrounding UI.
pub trait RunHooks: Send + Sync {
    /// `true` when a run starts, `false` once it has been finalized.
    fn set_running(&self, running: bool);
    /// Called exactly once per finalized run.
    fn on_test_complete(&self);
}

/// Everything the orchestrator needs from the presentation layer.
#[derive(Clone)]
pub struct Collaborators {
    pub presenter: Arc<dyn Presenter>,
    pub timer: Arc<dyn TimerDisplay>,
    pub prompt: Arc<dyn BandwidthPrompt>,
    pub hooks: Arc<dyn RunHooks>,
}

/// Collaborator that ignores every call. Handy for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct Headless;

impl Presenter for Headless {
    fn show(&self, _text: &str) {}
}

impl TimerDisplay for Headless {
    fn start(&self) {}
    fn stop(&self) {}
}

impl RunHooks for Headless {
    fn set_running(&self, _running: bool) {}
    fn on_test_complete(&self) {}
}

/// Prompt that answers immediately with a fixed decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub bool);

impl BandwidthPrompt for FixedDecision {
    fn ask(&self, on_decision: DecisionFn) {
        on_decision(self.0);
    }
}

impl Collaborators {
    /// No output, no timer, always reduce on high loss.
    pub fn headless() -> Self {
        Self {
            presenter: Arc::new(Headless),
            timer: Arc::new(Headless),
            prompt: Arc::new(FixedDecision(true)),
            hooks: Arc::new(Headless),
        }
    }
}
