//! Simulated execution engine.
//!
//! Emits iperf3-style interval lines against a synthetic link so the
//! controller can be exercised without a server. TCP runs report a
//! jittered share of the link capacity. UDP runs report the offered rate
//! capped by capacity, plus the loss that overdriving the link produces.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::args::{TestArguments, UDP_FLAG};
use crate::engine::{EngineSink, ExecutionEngine};

/// Synthetic link model.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkModel {
    pub capacity_mbps: f64,
    /// Capacity varies by up to this fraction per interval.
    pub jitter: f64,
    /// Loss (%) seen even below capacity.
    pub base_loss_percent: f64,
    /// Chance per run that the simulated test stalls until aborted.
    pub stall_probability: f64,
    /// Fixed RNG seed for reproducible output.
    pub seed: Option<u64>,
}

impl Default for LinkModel {
    fn default() -> Self {
        Self {
            capacity_mbps: 250.0,
            jitter: 0.15,
            base_loss_percent: 0.2,
            stall_probability: 0.0,
            seed: None,
        }
    }
}

pub struct SimulatedEngine {
    link: LinkModel,
    aborts: watch::Sender<u64>,
}

impl SimulatedEngine {
    pub fn new(link: LinkModel) -> Self {
        let (aborts, _) = watch::channel(0);
        Self { link, aborts }
    }

    fn rng(&self) -> StdRng {
        match self.link.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(LinkModel::default())
    }
}

/// One interval's numbers.
struct Sample {
    mbps: f64,
    lost: u64,
    total: u64,
}

impl ExecutionEngine for SimulatedEngine {
    fn run(
        &self,
        args: TestArguments,
        sink: Arc<dyn EngineSink>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let link = self.link.clone();
        let mut rng = self.rng();
        // Starts out "seen": only aborts issued from here on concern this run.
        let mut aborted = self.aborts.subscribe();

        async move {
            let host = args.value_of("-c").unwrap_or("localhost").to_string();
            let port = args.value_of("-p").unwrap_or("5201").to_string();
            let seconds = args.test_duration().as_secs().max(1);
            let interval = args
                .value_of("-i")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(1);
            let udp = args.contains(UDP_FLAG);
            let offered = args.extract_bandwidth_mbps().map(f64::from).unwrap_or(1.0);
            let stalls = rng.random_bool(link.stall_probability.clamp(0.0, 1.0));

            sink.on_line(&format!("Connecting to host {host}, port {port}"));
            sink.on_line(&format!(
                "[  5] local 127.0.0.1 port 50000 connected to {host} port {port}"
            ));
            let header = if udp {
                "[ ID] Interval           Transfer     Bitrate         Jitter    Lost/Total Datagrams"
            } else {
                "[ ID] Interval           Transfer     Bitrate"
            };
            sink.on_line(header);

            let mut elapsed = 0;
            let mut total_mbits = 0.0;
            while elapsed < seconds {
                let step = interval.min(seconds - elapsed);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(step)) => {}
                    Ok(()) = aborted.changed() => {
                        interrupted(sink.as_ref());
                        return;
                    }
                    _ = cancel.cancelled() => return,
                }
                if stalls && elapsed > 0 {
                    break;
                }

                let sample = sample(&mut rng, &link, udp, offered, step);
                total_mbits += sample.mbps * step as f64;
                sink.on_line(&interval_line(elapsed, elapsed + step, &sample, udp));
                elapsed += step;
            }

            if stalls {
                tracing::debug!("simulated test stalled");
                tokio::select! {
                    Ok(()) = aborted.changed() => interrupted(sink.as_ref()),
                    _ = cancel.cancelled() => {}
                }
                return;
            }

            let average = total_mbits / seconds as f64;
            sink.on_line("- - - - - - - - - - - - - - - - - - - - - - - - -");
            sink.on_line(&format!(
                "[  5]   0.00-{seconds}.00  sec  {:.2} MBytes  {average:.1} Mbits/sec  sender",
                total_mbits / 8.0
            ));
            sink.on_line("");
            sink.on_line("iperf Done.");
            sink.on_complete();
        }
        .boxed()
    }

    fn abort(&self, sink: Arc<dyn EngineSink>) {
        sink.on_line("Stopping simulated test");
        self.aborts.send_modify(|n| *n += 1);
    }
}

fn interrupted(sink: &dyn EngineSink) {
    sink.on_line("iperf3: interrupt - the client has terminated");
    sink.on_complete();
}

fn sample(rng: &mut StdRng, link: &LinkModel, udp: bool, offered: f64, secs: u64) -> Sample {
    let jitter = link.jitter.clamp(0.0, 0.99);
    let capacity = link.capacity_mbps * (1.0 - rng.random_range(0.0..=jitter));
    if !udp {
        return Sample {
            mbps: capacity,
            lost: 0,
            total: 0,
        };
    }

    let mut loss = link.base_loss_percent * rng.random_range(0.0..2.0);
    if offered > capacity {
        loss += (offered - capacity) / offered * 100.0;
    }
    let loss = loss.clamp(0.0, 100.0);

    // 1448-byte datagrams.
    let total = ((offered * 1_000_000.0 * secs as f64) / (1448.0 * 8.0)).round() as u64;
    let lost = (total as f64 * loss / 100.0).round() as u64;
    Sample {
        mbps: offered.min(capacity),
        lost,
        total: total.max(1),
    }
}

fn interval_line(from: u64, to: u64, sample: &Sample, udp: bool) -> String {
    let mbytes = sample.mbps * (to - from) as f64 / 8.0;
    let base = format!(
        "[  5]   {from}.00-{to}.00   sec  {mbytes:.2} MBytes  {:.1} Mbits/sec",
        sample.mbps
    );
    if !udp {
        return base;
    }
    let percent = sample.lost as f64 * 100.0 / sample.total as f64;
    format!(
        "{base}  0.031 ms  {}/{} ({percent:.2}%)",
        sample.lost, sample.total
    )
}
