//! Test profiles: builds an iperf argument list and the matching strategy
//! flags from a handful of named settings.
//!
//! UDP-based protocols require a target bandwidth and add `-u -b {bw}M`.
//! The hybrid protocol starts as plain TCP; the orchestrator's estimation
//! pass switches it to UDP once a ceiling is known.

use serde::{Deserialize, Serialize};

use crate::args::{TestArguments, BIDIR_FLAG, REVERSE_FLAG, UDP_FLAG};
use crate::config::Strategy;
use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 5202;
pub const DEFAULT_DURATION_S: u32 = 30;
pub const DEFAULT_INTERVAL_S: u32 = 1;

// ── Direction ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Upload,
    Download,
    Bidir,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
            Direction::Bidir => write!(f, "bidir"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Direction::Upload),
            "download" => Ok(Direction::Download),
            "bidir" => Ok(Direction::Bidir),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

// ── Protocol ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    /// UDP on the fixed incremental schedule.
    UdpIncremental,
    /// UDP with throughput-driven ramp-up.
    SmartRamp,
    /// TCP estimation pass, then UDP at the estimate.
    Hybrid,
}

impl Protocol {
    pub fn requires_bandwidth(self) -> bool {
        matches!(
            self,
            Protocol::Udp | Protocol::UdpIncremental | Protocol::SmartRamp
        )
    }

    pub fn strategy(self) -> Strategy {
        Strategy {
            incremental_ramp_up: self == Protocol::UdpIncremental,
            smart_ramp_up: self == Protocol::SmartRamp,
            hybrid: self == Protocol::Hybrid,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::UdpIncremental => write!(f, "udp-incremental"),
            Protocol::SmartRamp => write!(f, "smart-ramp"),
            Protocol::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "udp-incremental" => Ok(Protocol::UdpIncremental),
            "smart-ramp" => Ok(Protocol::SmartRamp),
            "hybrid" => Ok(Protocol::Hybrid),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

// ── Profile ─────────────────────────────────────────────────────────

/// Named test settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestProfile {
    pub server: String,
    pub port: u16,
    pub duration_s: u32,
    pub interval_s: u32,
    pub parallel: Option<u32>,
    pub direction: Direction,
    pub protocol: Protocol,
    pub bandwidth_mbps: Option<u32>,
    pub debug: bool,
    pub verbose: bool,
}

impl Default for TestProfile {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            duration_s: DEFAULT_DURATION_S,
            interval_s: DEFAULT_INTERVAL_S,
            parallel: None,
            direction: Direction::default(),
            protocol: Protocol::default(),
            bandwidth_mbps: None,
            debug: false,
            verbose: false,
        }
    }
}

impl TestProfile {
    /// Argument list and strategy flags for this profile.
    pub fn build(&self) -> Result<(TestArguments, Strategy), ConfigError> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server",
                expected: "a host name or address",
            });
        }
        if self.duration_s == 0 {
            return Err(ConfigError::Invalid {
                field: "duration",
                expected: "at least 1 second",
            });
        }
        if self.interval_s == 0 {
            return Err(ConfigError::Invalid {
                field: "interval",
                expected: "at least 1 second",
            });
        }

        let mut tokens = vec![
            "-c".to_string(),
            server.to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-t".to_string(),
            self.duration_s.to_string(),
            "-i".to_string(),
            self.interval_s.to_string(),
        ];

        if let Some(parallel) = self.parallel {
            tokens.push("-P".to_string());
            tokens.push(parallel.to_string());
        }

        match self.direction {
            Direction::Upload => {}
            Direction::Download => tokens.push(REVERSE_FLAG.to_string()),
            Direction::Bidir => tokens.push(BIDIR_FLAG.to_string()),
        }

        if self.protocol.requires_bandwidth() {
            let bw = self
                .bandwidth_mbps
                .filter(|bw| *bw > 0)
                .ok_or_else(|| ConfigError::MissingBandwidth(self.protocol.to_string()))?;
            tokens.push(UDP_FLAG.to_string());
            tokens.push("-b".to_string());
            tokens.push(format!("{bw}M"));
        }

        if self.debug {
            tokens.push("-d".to_string());
        }
        if self.verbose {
            tokens.push("-V".to_string());
        }

        Ok((TestArguments::new(tokens), self.protocol.strategy()))
    }
}
