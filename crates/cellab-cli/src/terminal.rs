//! Terminal collaborators: stdout presenter, elapsed timer, stdin prompt.

use std::io::{BufRead, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cellab_core::ui::{BandwidthPrompt, DecisionFn, Presenter, RunHooks, TimerDisplay};
use crossbeam_channel::{Receiver, RecvTimeoutError};

// ── Presenter ───────────────────────────────────────────────────────

pub struct StdoutPresenter;

impl Presenter for StdoutPresenter {
    fn show(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }
}

// ── Timer ───────────────────────────────────────────────────────────

/// Prints the elapsed run time when the run is finalized.
#[derive(Default)]
pub struct TerminalTimer {
    started: Mutex<Option<Instant>>,
}

impl TerminalTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerDisplay for TerminalTimer {
    fn start(&self) {
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
    }

    fn stop(&self) {
        let started = self.started.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(started) = started {
            println!("Elapsed time: {}", format_elapsed(started.elapsed()));
        }
    }
}

/// `HH:MM:SS`; hours keep counting past 24.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

// ── Prompt ──────────────────────────────────────────────────────────

/// Asks on stdout and reads the answer from stdin. Unanswered questions
/// resolve to "yes" after the countdown.
///
/// One reader thread owns stdin for the life of the process; lines typed
/// while no question is pending are discarded.
pub struct StdinPrompt {
    lines: Receiver<String>,
    countdown: Duration,
}

impl StdinPrompt {
    pub fn spawn(countdown: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::Builder::new()
            .name("cellab-stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| tracing::warn!(error = %e, "failed to spawn stdin reader"))
            .ok();
        Self {
            lines: rx,
            countdown,
        }
    }
}

impl BandwidthPrompt for StdinPrompt {
    fn ask(&self, on_decision: DecisionFn) {
        let lines = self.lines.clone();
        let countdown = self.countdown;
        while lines.try_recv().is_ok() {}

        println!(
            "Reduce bandwidth? [Y/n] (auto-yes in {}s)",
            countdown.as_secs()
        );
        let spawned = std::thread::Builder::new()
            .name("cellab-prompt".into())
            .spawn(move || {
                let answer = match lines.recv_timeout(countdown) {
                    Ok(line) => parse_answer(&line),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => true,
                };
                on_decision(answer);
            });
        if let Err(e) = spawned {
            // The controller treats an unanswered prompt as "yes".
            tracing::warn!(error = %e, "failed to spawn prompt thread");
        }
    }
}

/// Anything but an explicit no counts as yes.
pub fn parse_answer(line: &str) -> bool {
    !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no")
}

// ── Hooks ───────────────────────────────────────────────────────────

pub struct TracingHooks;

impl RunHooks for TracingHooks {
    fn set_running(&self, running: bool) {
        tracing::debug!(running, "run state changed");
    }

    fn on_test_complete(&self) {
        tracing::info!("run finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "00:01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 59 * 60 + 59)), "03:59:59");
        assert_eq!(format_elapsed(Duration::from_secs(30 * 3600)), "30:00:00");
    }

    #[test]
    fn answers() {
        assert!(parse_answer(""));
        assert!(parse_answer("y"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("n"));
        assert!(!parse_answer("No"));
    }
}
