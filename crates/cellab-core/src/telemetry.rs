//! Telemetry parsing: pulls throughput and packet loss out of iperf output.
//!
//! Most lines the engine emits are neither (headers, connection banners,
//! separators), so `None` is the common result and never an error.

use once_cell::sync::Lazy;
use regex::Regex;

static THROUGHPUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+(\d+(?:\.\d+)?)\s+([KMG])?bits/sec").expect("valid regex"));

static LOSS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+(?:\.\d+)?)%\)").expect("valid regex"));

/// Parse the throughput of an interval or summary line, in whole Mbps.
///
/// `K` divides by 1000, `M` is taken as-is, `G` multiplies by 1000 and a
/// bare `bits/sec` is treated as raw bits per second. The result is
/// truncated, so `5 Kbits/sec` reads as 0.
pub fn parse_throughput_mbps(line: &str) -> Option<u32> {
    let caps = THROUGHPUT_RE.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let mbps = match caps.get(2).map(|m| m.as_str()) {
        Some("K") => value / 1000.0,
        Some("M") => value,
        Some("G") => value * 1000.0,
        _ => value / 1_000_000.0,
    };
    if !mbps.is_finite() {
        return None;
    }
    // `as` saturates on overflow, which is fine for absurd values.
    Some(mbps as u32)
}

/// Parse a packet-loss percentage such as `(12.3%)`.
pub fn parse_packet_loss_percent(line: &str) -> Option<f32> {
    LOSS_RE.captures(line)?.get(1)?.as_str().parse().ok()
}
