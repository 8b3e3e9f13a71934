//! iperf argument list and the bandwidth editor.
//!
//! [`TestArguments`] is immutable: every edit returns a fresh list, so a
//! list handed to a running engine is never changed underneath it. The
//! controller only reads or writes `-b`, `-t` and `-u`; every other token
//! passes through untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const BANDWIDTH_FLAG: &str = "-b";
pub const DURATION_FLAG: &str = "-t";
pub const UDP_FLAG: &str = "-u";
pub const REVERSE_FLAG: &str = "-R";
pub const BIDIR_FLAG: &str = "--bidir";

/// Test length iperf uses when `-t` is absent.
pub const DEFAULT_TEST_SECONDS: u64 = 10;

/// Ordered iperf invocation tokens (flags and values).
#[derive(Clone, PartialEq, Eq)]
pub struct TestArguments(Arc<[String]>);

impl TestArguments {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// Split a raw command line on whitespace.
    pub fn parse_command(line: &str) -> Self {
        Self::new(line.split_whitespace())
    }

    /// Drop a leading `iperf3`/`iperf` program token, if any.
    pub fn without_program(&self) -> Self {
        match self.0.first() {
            Some(first) if is_program_token(first) => Self(self.0[1..].into()),
            _ => self.clone(),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.to_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.iter().any(|t| t == flag)
    }

    fn position(&self, flag: &str) -> Option<usize> {
        self.0.iter().position(|t| t == flag)
    }

    /// Token following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let idx = self.position(flag)?;
        self.0.get(idx + 1).map(String::as_str)
    }

    /// Target bandwidth from `-b`, in Mbps.
    ///
    /// Accepts a bare number or one with a `K`/`M`/`G` suffix (`500M`,
    /// `1G`). Kilobit values are truncated to whole Mbps.
    pub fn extract_bandwidth_mbps(&self) -> Option<u32> {
        parse_bandwidth_token(self.value_of(BANDWIDTH_FLAG)?)
    }

    /// Return a copy with `-b` set to `mbps`, appending the flag if absent.
    pub fn with_bandwidth(&self, mbps: u32) -> Self {
        let value = format!("{mbps}M");
        let mut tokens = self.to_vec();
        match self.position(BANDWIDTH_FLAG) {
            Some(idx) if idx + 1 < tokens.len() => tokens[idx + 1] = value,
            // Dangling `-b` at the end: give it a value rather than a second flag.
            Some(_) => tokens.push(value),
            None => {
                tokens.push(BANDWIDTH_FLAG.to_string());
                tokens.push(value);
            }
        }
        Self(tokens.into())
    }

    /// Append `flag` unless it is already present.
    pub fn with_flag(&self, flag: &str) -> Self {
        if self.contains(flag) {
            return self.clone();
        }
        let mut tokens = self.to_vec();
        tokens.push(flag.to_string());
        Self(tokens.into())
    }

    /// Nominal test length from `-t`, falling back to iperf's default.
    pub fn test_duration(&self) -> Duration {
        let secs = self
            .value_of(DURATION_FLAG)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TEST_SECONDS);
        Duration::from_secs(secs)
    }

    pub fn is_udp(&self) -> bool {
        self.contains(UDP_FLAG)
    }

    /// TCP bidirectional variant used to estimate a bandwidth ceiling.
    ///
    /// Drops `-u`, `-b <value>` and `-R`, then adds `--bidir`. Returns the
    /// new list and a description of each removed flag.
    pub fn tcp_estimation_variant(&self) -> (Self, Vec<&'static str>) {
        let mut removed = Vec::new();
        let mut tokens = Vec::with_capacity(self.len() + 1);
        let mut iter = self.0.iter();
        while let Some(token) = iter.next() {
            match token.as_str() {
                UDP_FLAG => {
                    if !removed.contains(&"-u") {
                        removed.push("-u");
                    }
                }
                BANDWIDTH_FLAG => {
                    iter.next();
                    removed.push("-b <value>");
                }
                REVERSE_FLAG => removed.push("-R"),
                _ => tokens.push(token.clone()),
            }
        }
        if !tokens.iter().any(|t| t == BIDIR_FLAG) {
            tokens.push(BIDIR_FLAG.to_string());
        }
        (Self(tokens.into()), removed)
    }

    /// Tokens joined with single spaces.
    pub fn command_line(&self) -> String {
        self.0.join(" ")
    }
}

impl fmt::Display for TestArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

impl fmt::Debug for TestArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl From<Vec<String>> for TestArguments {
    fn from(tokens: Vec<String>) -> Self {
        Self(tokens.into())
    }
}

fn parse_bandwidth_token(token: &str) -> Option<u32> {
    let (number, scale) = match token.chars().last()? {
        'K' | 'k' => (&token[..token.len() - 1], 0.001),
        'M' | 'm' => (&token[..token.len() - 1], 1.0),
        'G' | 'g' => (&token[..token.len() - 1], 1000.0),
        _ => (token, 1.0),
    };
    let value: f64 = number.parse().ok()?;
    let mbps = value * scale;
    if !mbps.is_finite() || mbps < 0.0 {
        return None;
    }
    Some(mbps as u32)
}

fn is_program_token(token: &str) -> bool {
    let name = token.rsplit('/').next().unwrap_or(token);
    name == "iperf3" || name == "iperf"
}
