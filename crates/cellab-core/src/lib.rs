//! Adaptive iperf test-iteration controller.
//!
//! This crate contains:
//! - **Telemetry parsing**: throughput and packet-loss extraction from output lines
//! - **Argument editing**: copy-on-write bandwidth rewrites of the iperf argument list
//! - **Iteration controller**: launch, watchdog, resolve-once race, loss-triggered
//!   reduction, cancel-and-join, ramp evaluation
//! - **Run orchestrator**: hybrid pre-pass, iteration loop, backoff, one-shot finalize
//! - **Log sink**: rotating per-run log files mirrored to the presentation layer
//!
//! The execution engine and all presentation surfaces are injected as traits
//! (see [`engine`] and [`ui`]).

pub mod args;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod log_sink;
pub mod loss;
pub mod orchestrator;
pub mod profile;
pub mod ramp;
pub mod resolve;
pub mod simulate;
pub mod telemetry;
pub mod ui;

pub use args::TestArguments;
pub use config::{ControllerTuning, IterationConfig, LogConfig, Strategy};
pub use controller::{IterationController, IterationOutcome, IterationReport, RunState};
pub use engine::{CallbackSink, EngineSink, ExecutionEngine};
pub use error::{ConfigError, IterationError, LabError};
pub use log_sink::LogSink;
pub use orchestrator::{RunHandle, RunOrchestrator, RunOutcome, RunReport};
pub use ui::Collaborators;
