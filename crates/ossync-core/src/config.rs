//! Platform and timer configuration.
//!
//! Process-wide settings are read once, when the [`Platform`](crate::Platform)
//! is installed, from these environment variables:
//! - `OSSYNC_INSTRUMENT`: `off` (default) or `stats`. `stats` wraps every
//!   semaphore created afterwards in the counting decorator.
//! - `OSSYNC_FATAL`: `panic` (default) or `abort`. Selects what a contract
//!   violation does after it has been logged.
//! - `OSSYNC_TLS`: `native` (default) or `stack-range`. Selects the backing
//!   store of thread-local slots.
//! - `OSSYNC_STACK_KB`: default stack size for spawned threads, in KiB.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default stack size for threads created with [`StackSize::Default`](crate::StackSize).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest stack size accepted from the environment.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Malformed configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: unrecognized value '{value}'")]
    UnknownValue { var: &'static str, value: String },
    #[error("{var}: invalid stack size '{value}' (expected KiB >= {min})", min = MIN_STACK_SIZE / 1024)]
    InvalidStackSize { var: &'static str, value: String },
}

/// Semaphore instrumentation level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentLevel {
    /// Plain backing primitives, no counters.
    #[default]
    Off,
    /// Every semaphore goes through the statistics decorator.
    Stats,
}

impl InstrumentLevel {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Some(Self::Off),
            "stats" | "on" | "profile" | "1" => Some(Self::Stats),
            _ => None,
        }
    }
}

/// What happens after a contract violation has been reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalPolicy {
    /// Unwind with a `file:line: message` panic.
    #[default]
    Panic,
    /// Terminate the process immediately.
    Abort,
}

impl FatalPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Some(Self::Panic),
            "abort" | "terminate" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Backing store of the thread-local slot tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsStrategy {
    /// `thread_local!` storage.
    #[default]
    Native,
    /// Sorted stack-address ranges searched by the address of a local.
    StackRange,
}

impl TlsStrategy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "tls" => Some(Self::Native),
            "stack-range" | "stack_range" | "stack" => Some(Self::StackRange),
            _ => None,
        }
    }
}

/// Process-wide settings fixed at [`Platform`](crate::Platform) install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub instrument: InstrumentLevel,
    pub fatal_policy: FatalPolicy,
    pub tls: TlsStrategy,
    /// Stack size used when a thread asks for the default, in bytes.
    pub default_stack_size: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            instrument: InstrumentLevel::Off,
            fatal_policy: FatalPolicy::Panic,
            tls: TlsStrategy::Native,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl PlatformConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a configuration from an arbitrary variable lookup. Unset
    /// variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("OSSYNC_INSTRUMENT") {
            config.instrument =
                InstrumentLevel::from_str_loose(&raw).ok_or(ConfigError::UnknownValue {
                    var: "OSSYNC_INSTRUMENT",
                    value: raw,
                })?;
        }
        if let Some(raw) = lookup("OSSYNC_FATAL") {
            config.fatal_policy =
                FatalPolicy::from_str_loose(&raw).ok_or(ConfigError::UnknownValue {
                    var: "OSSYNC_FATAL",
                    value: raw,
                })?;
        }
        if let Some(raw) = lookup("OSSYNC_TLS") {
            config.tls = TlsStrategy::from_str_loose(&raw).ok_or(ConfigError::UnknownValue {
                var: "OSSYNC_TLS",
                value: raw,
            })?;
        }
        if let Some(raw) = lookup("OSSYNC_STACK_KB") {
            config.default_stack_size = parse_stack_kb(&raw).ok_or(ConfigError::InvalidStackSize {
                var: "OSSYNC_STACK_KB",
                value: raw,
            })?;
        }
        Ok(config)
    }
}

fn parse_stack_kb(raw: &str) -> Option<usize> {
    let kib: usize = raw.trim().parse().ok()?;
    let bytes = kib.checked_mul(1024)?;
    (bytes >= MIN_STACK_SIZE).then_some(bytes)
}

/// Timer scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Longest the scheduler sleeps without re-reading the clock. Bounds how
    /// long a wall-clock correction goes unnoticed.
    pub max_poll_interval: Duration,
    /// Forward clock movement beyond the expected wait plus this slack is
    /// treated as a clock adjustment rather than elapsed time.
    pub skew_slack: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_millis(500),
            skew_slack: Duration::from_secs(2),
        }
    }
}
