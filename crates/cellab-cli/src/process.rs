//! Process engine: runs `iperf3` as a child process.
//!
//! stdout and stderr lines are forwarded to the sink as they arrive. A
//! zero exit status completes the run; anything else is reported as an
//! error carrying the last stderr line.
//!
//! Stopping follows the usual pattern for a child we own: SIGINT first so
//! iperf3 can print its interrupt summary, then SIGKILL once the grace
//! period has passed. Output written during the grace is still forwarded.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellab_core::{EngineSink, ExecutionEngine, TestArguments};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Environment variable overriding the iperf binary.
pub const IPERF_BIN_ENV: &str = "CELLAB_IPERF_BIN";

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

pub struct ProcessEngine {
    binary: String,
    stop_grace: Duration,
    /// PID of the running child, if any.
    running: Arc<Mutex<Option<u32>>>,
}

impl ProcessEngine {
    pub fn new(binary: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            stop_grace,
            running: Arc::new(Mutex::new(None)),
        }
    }

    fn current_pid(&self) -> Option<u32> {
        *self.running.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn set_running(slot: &Mutex<Option<u32>>, pid: Option<u32>) {
    *slot.lock().unwrap_or_else(|p| p.into_inner()) = pid;
}

impl ExecutionEngine for ProcessEngine {
    fn run(
        &self,
        args: TestArguments,
        sink: Arc<dyn EngineSink>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let binary = self.binary.clone();
        let grace = self.stop_grace;
        let running = self.running.clone();

        async move {
            let mut cmd = Command::new(&binary);
            cmd.args(args.as_slice())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            tracing::info!(cmd = ?cmd, "spawning iperf");
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    sink.on_error(&format!("failed to start {binary}: {e}"));
                    return;
                }
            };
            set_running(&running, child.id());

            let Drained {
                last_stderr,
                interrupted,
            } = pump(&mut child, sink.as_ref(), &cancel, grace).await;
            let result = if interrupted {
                None
            } else {
                tokio::select! {
                    status = child.wait() => Some((status, last_stderr)),
                    _ = cancel.cancelled() => None,
                }
            };

            match result {
                Some((Ok(status), _)) if status.success() => {
                    set_running(&running, None);
                    sink.on_complete();
                }
                Some((Ok(status), last_stderr)) => {
                    set_running(&running, None);
                    let detail = last_stderr.map(|l| format!(": {l}")).unwrap_or_default();
                    sink.on_error(&format!("{binary} exited with {status}{detail}"));
                }
                Some((Err(e), _)) => {
                    set_running(&running, None);
                    sink.on_error(&format!("failed to wait for {binary}: {e}"));
                }
                None => {
                    if !interrupted {
                        if let Some(pid) = child.id() {
                            send_interrupt(pid);
                        }
                    }
                    reap(&mut child, grace).await;
                    set_running(&running, None);
                }
            }
        }
        .boxed()
    }

    fn abort(&self, sink: Arc<dyn EngineSink>) {
        let Some(pid) = self.current_pid() else {
            tracing::debug!("abort requested with no iperf running");
            return;
        };
        sink.on_line(&format!("Sending interrupt to iperf (pid {pid})"));
        send_interrupt(pid);

        // Escalate if the same child is still around after the grace.
        let running = self.running.clone();
        let grace = self.stop_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    let still_running = *running.lock().unwrap_or_else(|p| p.into_inner());
                    if still_running == Some(pid) {
                        tracing::warn!(pid, "iperf ignored interrupt, killing");
                        sink.on_line("iperf did not stop, killing it");
                        send_kill(pid);
                    }
                });
            }
            Err(_) => tracing::warn!(pid, "no runtime to escalate abort"),
        }
    }
}

struct Drained {
    last_stderr: Option<String>,
    /// Cancelled while reading; the child has already been sent SIGINT.
    interrupted: bool,
}

/// Forward output until both pipes close.
///
/// On cancel the child gets SIGINT and reading goes on for up to `grace`,
/// so the interrupt summary still reaches the sink. Past that the child is
/// killed.
async fn pump(
    child: &mut Child,
    sink: &dyn EngineSink,
    cancel: &CancellationToken,
    grace: Duration,
) -> Drained {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut last_stderr = None;
    let mut drain_until: Option<Instant> = None;

    loop {
        if stdout.is_none() && stderr.is_none() {
            return Drained {
                last_stderr,
                interrupted: drain_until.is_some(),
            };
        }
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => sink.on_line(&line),
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => {
                    sink.on_line(&line);
                    last_stderr = Some(line);
                }
                None => stderr = None,
            },
            _ = cancel.cancelled(), if drain_until.is_none() => {
                if let Some(pid) = child.id() {
                    send_interrupt(pid);
                }
                drain_until = Some(Instant::now() + grace);
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)),
                if drain_until.is_some() =>
            {
                tracing::warn!("iperf output still open after interrupt, killing");
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill after interrupt failed");
                }
                return Drained {
                    last_stderr,
                    interrupted: true,
                };
            }
        }
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let lines = lines.as_mut()?;
    match lines.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read iperf output");
            None
        }
    }
}

/// Wait for an interrupted child, killing it once `grace` has passed.
async fn reap(child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => tracing::info!("iperf exited after interrupt"),
        Err(_) => {
            tracing::warn!("iperf didn't exit cleanly, killing");
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    // SAFETY: `pid` is the ID of our own child. Sending SIGINT to a process
    // that already exited is a no-op (kill returns -1 / ESRCH).
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) {
    tracing::debug!(pid, "no SIGINT on this platform, relying on kill");
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    // SAFETY: as above.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn send_kill(pid: u32) {
    tracing::warn!(pid, "cannot kill iperf on this platform");
}
