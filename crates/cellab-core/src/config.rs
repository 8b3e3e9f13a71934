//! Run configuration and controller tuning.
//!
//! A TOML file is parsed into the `*Input` structs (every field optional)
//! and resolved into validated configs with defaults filled in:
//!
//! ```toml
//! version = 1
//!
//! [run]
//! iterations = 5
//! wait_time_s = 15
//! auto_reduce = true
//!
//! [run.strategy]
//! smart_ramp_up = true
//!
//! [tuning]
//! watchdog_margin_s = 15
//! decision_countdown_s = 15
//!
//! [log]
//! dir = "/var/log/cellab"
//! max_part_bytes = 5242880
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::args::TestArguments;
use crate::error::ConfigError;
use crate::loss::{DEFAULT_LOSS_THRESHOLD, DEFAULT_REQUIRED_HIGH};
use crate::ramp::RampPolicy;

pub const CONFIG_VERSION: u32 = 1;

/// Byte cap per log part file (5 MiB).
pub const DEFAULT_MAX_PART_BYTES: u64 = 5 * 1024 * 1024;

// ── Strategy ────────────────────────────────────────────────────────

/// Bandwidth strategy flags. Not mutually exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    pub incremental_ramp_up: bool,
    pub smart_ramp_up: bool,
    pub hybrid: bool,
}

// ── Iteration config ────────────────────────────────────────────────

/// Per-run settings for the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationConfig {
    /// Nominal length of one iteration (`-t`).
    pub duration: Duration,
    pub iterations: u32,
    /// Fixed pause between iterations.
    pub wait_time: Duration,
    pub strategy: Strategy,
    pub auto_reduce: bool,
}

impl IterationConfig {
    /// Config with the duration taken from the argument list.
    pub fn for_args(args: &TestArguments, iterations: u32, wait_time: Duration) -> Self {
        Self {
            duration: args.test_duration(),
            iterations,
            wait_time,
            strategy: Strategy::default(),
            auto_reduce: false,
        }
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_auto_reduce(mut self, enabled: bool) -> Self {
        self.auto_reduce = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "iterations",
                expected: "at least 1",
            });
        }
        Ok(())
    }
}

// ── Tuning ──────────────────────────────────────────────────────────

/// Timing and threshold constants of the iteration controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerTuning {
    /// Seed for the smart ramp step (Mbps).
    pub default_step_mbps: u32,
    pub ramp: RampPolicy,
    /// Added to the test duration to arm the watchdog
    /// (start-up slack plus grace).
    pub watchdog_margin: Duration,
    /// Error backoff as a fraction of the test duration.
    pub error_backoff_ratio: f64,
    pub error_backoff_floor: Duration,
    /// How long the bandwidth prompt may stay unanswered.
    pub decision_countdown: Duration,
    /// How long to wait for a cancelled engine task before aborting it.
    pub drain_grace: Duration,
    pub loss_threshold: f32,
    pub loss_required: usize,
    /// Multiplier applied to the step on a loss-triggered reduction.
    pub reduce_factor: f64,
    pub reduce_floor_mbps: u32,
}

impl Default for ControllerTuning {
    fn default() -> Self {
        Self {
            default_step_mbps: 50,
            ramp: RampPolicy::default(),
            watchdog_margin: Duration::from_secs(15),
            error_backoff_ratio: 0.33,
            error_backoff_floor: Duration::from_secs(20),
            decision_countdown: Duration::from_secs(15),
            drain_grace: Duration::from_secs(5),
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            loss_required: DEFAULT_REQUIRED_HIGH,
            reduce_factor: 0.8,
            reduce_floor_mbps: 10,
        }
    }
}

impl ControllerTuning {
    pub fn watchdog_timeout(&self, duration: Duration) -> Duration {
        duration.saturating_add(self.watchdog_margin)
    }

    pub fn error_backoff(&self, duration: Duration) -> Duration {
        duration
            .mul_f64(self.error_backoff_ratio)
            .max(self.error_backoff_floor)
    }

    /// Step after a loss-triggered reduction.
    pub fn reduced_step(&self, step: u32) -> u32 {
        let reduced = (f64::from(step) * self.reduce_factor).floor() as u32;
        reduced.max(self.reduce_floor_mbps)
    }
}

// ── Log ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Directory for part files. `None` disables file logging.
    pub dir: Option<PathBuf>,
    pub max_part_bytes: u64,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_part_bytes: DEFAULT_MAX_PART_BYTES,
            file_prefix: "iperf3".to_string(),
        }
    }
}

// ── TOML input ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabConfigInput {
    pub version: u32,
    pub run: RunInput,
    pub tuning: TuningInput,
    pub log: LogInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunInput {
    pub iterations: Option<u32>,
    pub wait_time_s: Option<u64>,
    pub auto_reduce: Option<bool>,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TuningInput {
    pub default_step_mbps: Option<u32>,
    pub ramp_step_mbps: Option<u32>,
    pub watchdog_margin_s: Option<u64>,
    pub error_backoff_floor_s: Option<u64>,
    pub decision_countdown_s: Option<u64>,
    pub drain_grace_ms: Option<u64>,
    pub loss_threshold: Option<f32>,
    pub loss_required: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogInput {
    pub dir: Option<PathBuf>,
    pub max_part_bytes: Option<u64>,
    pub file_prefix: Option<String>,
}

/// Resolved file configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LabConfig {
    pub iterations: u32,
    pub wait_time: Duration,
    pub auto_reduce: bool,
    pub strategy: Strategy,
    pub tuning: ControllerTuning,
    pub log: LogConfig,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            wait_time: Duration::from_secs(15),
            auto_reduce: false,
            strategy: Strategy::default(),
            tuning: ControllerTuning::default(),
            log: LogConfig::default(),
        }
    }
}

impl LabConfigInput {
    pub fn resolve(self) -> Result<LabConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let defaults = LabConfig::default();

        let iterations = self.run.iterations.unwrap_or(defaults.iterations);
        if iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "run.iterations",
                expected: "at least 1",
            });
        }

        let mut tuning = defaults.tuning;
        if let Some(step) = self.tuning.default_step_mbps {
            if step == 0 {
                return Err(ConfigError::Invalid {
                    field: "tuning.default_step_mbps",
                    expected: "greater than 0",
                });
            }
            tuning.default_step_mbps = step;
        }
        if let Some(step) = self.tuning.ramp_step_mbps {
            tuning.ramp.step_mbps = step;
        }
        if let Some(s) = self.tuning.watchdog_margin_s {
            tuning.watchdog_margin = Duration::from_secs(s);
        }
        if let Some(s) = self.tuning.error_backoff_floor_s {
            tuning.error_backoff_floor = Duration::from_secs(s);
        }
        if let Some(s) = self.tuning.decision_countdown_s {
            tuning.decision_countdown = Duration::from_secs(s);
        }
        if let Some(ms) = self.tuning.drain_grace_ms {
            tuning.drain_grace = Duration::from_millis(ms);
        }
        if let Some(t) = self.tuning.loss_threshold {
            if !(0.0..=100.0).contains(&t) {
                return Err(ConfigError::Invalid {
                    field: "tuning.loss_threshold",
                    expected: "a percentage between 0 and 100",
                });
            }
            tuning.loss_threshold = t;
        }
        if let Some(n) = self.tuning.loss_required {
            tuning.loss_required = n.max(1);
        }

        let log = LogConfig {
            dir: self.log.dir,
            max_part_bytes: self
                .log
                .max_part_bytes
                .unwrap_or(DEFAULT_MAX_PART_BYTES)
                .max(1024),
            file_prefix: self
                .log
                .file_prefix
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or(defaults.log.file_prefix),
        };

        Ok(LabConfig {
            iterations,
            wait_time: self
                .run
                .wait_time_s
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_time),
            auto_reduce: self.run.auto_reduce.unwrap_or(defaults.auto_reduce),
            strategy: self.run.strategy,
            tuning,
            log,
        })
    }
}

impl LabConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(LabConfig::default());
        }
        let parsed: LabConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    /// Iteration config for a concrete argument list.
    pub fn iteration_config(&self, args: &TestArguments) -> IterationConfig {
        IterationConfig::for_args(args, self.iterations, self.wait_time)
            .with_strategy(self.strategy)
            .with_auto_reduce(self.auto_reduce)
    }
}
