//! Error taxonomy.

use std::time::Duration;

use thiserror::Error;

// ── Iteration ───────────────────────────────────────────────────────

/// Why an iteration (or the estimation pass) did not complete cleanly.
///
/// `Engine`, `Timeout` and `Panicked` are recoverable at iteration
/// granularity: the orchestrator backs off and moves on. `UserStop` always
/// goes straight to finalize. `EstimationFailure` only disables the hybrid
/// seed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IterationError {
    #[error("engine error: {0}")]
    Engine(String),
    #[error("no response within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("stopped by user")]
    UserStop,
    #[error("bandwidth estimation produced no usable throughput")]
    EstimationFailure,
    #[error("iteration task panicked: {0}")]
    Panicked(String),
}

impl IterationError {
    /// Whether the orchestrator should apply the error backoff.
    pub fn needs_backoff(&self) -> bool {
        matches!(
            self,
            IterationError::Engine(_) | IterationError::Timeout(_) | IterationError::Panicked(_)
        )
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("{field} must be {expected}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
    },
    #[error("protocol {0} requires a bandwidth")]
    MissingBandwidth(String),
}

// ── Orchestrator ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LabError {
    #[error("a test run is already active")]
    RunActive,
    #[error("argument list is empty")]
    EmptyArguments,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
