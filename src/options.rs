//! Connection and mock-broker configuration.
//!
//! [`ConnectionOptions`] is fixed when a client is constructed. It can be
//! built in code, loaded from a JSON file using the same camelCase keys the
//! bridge's browser clients use, and overridden from `BUSBRIDGE_*`
//! environment variables.

// Rust guideline compliant 2026-02

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Default mock-broker port.
pub const DEFAULT_PORT: u16 = 9870;

/// Default mock-broker bind address.
pub const DEFAULT_HOSTNAME: &str = "0.0.0.0";

/// Default path under which the bridge is served.
pub const DEFAULT_PREFIX: &str = "/bridge";

/// Client connection options. Durations are in milliseconds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// Reconnect automatically after the transport drops.
    pub auto_reconnect: bool,
    /// Milliseconds between keepalive pings while open.
    pub ping_interval: u64,
    /// Consecutive failed opens before giving up; `None` retries forever.
    pub reconnect_attempts: Option<u32>,
    /// Growth factor of the backoff delay, greater than 1.
    pub reconnect_exponent: f64,
    /// Lower bound of the backoff delay in milliseconds.
    pub delay_min: u64,
    /// Upper bound of the backoff delay in milliseconds.
    pub delay_max: u64,
    /// Jitter applied to the backoff delay, between 0 and 1.
    pub randomization_factor: f64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            ping_interval: 5000,
            reconnect_attempts: None,
            reconnect_exponent: 2.0,
            delay_min: 1000,
            delay_max: 5000,
            randomization_factor: 0.5,
        }
    }
}

impl ConnectionOptions {
    /// Keepalive period.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_interval)
    }

    /// Check the documented constraints between fields.
    pub fn validate(&self) -> Result<(), BusError> {
        let invalid = |reason: String| Err(BusError::InvalidOptions(reason));
        if self.ping_interval == 0 {
            return invalid("pingInterval must be positive".to_string());
        }
        if !(self.reconnect_exponent > 1.0 && self.reconnect_exponent.is_finite()) {
            return invalid(format!(
                "reconnectExponent must be a finite number > 1 (got {})",
                self.reconnect_exponent
            ));
        }
        if self.delay_min > self.delay_max {
            return invalid(format!(
                "delayMin ({}) exceeds delayMax ({})",
                self.delay_min, self.delay_max
            ));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return invalid(format!(
                "randomizationFactor must be within 0..=1 (got {})",
                self.randomization_factor
            ));
        }
        Ok(())
    }

    /// Load options from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut options: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid connection options in {}", path.display()))?;
        options.apply_env_overrides();
        Ok(options)
    }

    /// Apply `BUSBRIDGE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parsed(&lookup, "BUSBRIDGE_AUTO_RECONNECT") {
            self.auto_reconnect = value;
        }
        if let Some(value) = parsed(&lookup, "BUSBRIDGE_PING_INTERVAL") {
            self.ping_interval = value;
        }
        if let Some(raw) = lookup("BUSBRIDGE_RECONNECT_ATTEMPTS") {
            match raw.trim() {
                "" | "unbounded" | "infinite" => self.reconnect_attempts = None,
                other => match other.parse() {
                    Ok(n) => self.reconnect_attempts = Some(n),
                    Err(e) => log::warn!(
                        "Ignoring BUSBRIDGE_RECONNECT_ATTEMPTS={}: {}",
                        other,
                        e
                    ),
                },
            }
        }
        if let Some(value) = parsed(&lookup, "BUSBRIDGE_DELAY_MIN") {
            self.delay_min = value;
        }
        if let Some(value) = parsed(&lookup, "BUSBRIDGE_DELAY_MAX") {
            self.delay_max = value;
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {}={}: {}", name, raw, e);
            None
        }
    }
}

/// Mock broker settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MockBrokerOptions {
    /// Path prefix under which the bridge transport is exposed.
    pub prefix: String,
}

impl Default for MockBrokerOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Where the mock broker listens.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ListenOptions {
    /// TCP port; `0` picks a free one.
    pub port: u16,
    /// Interface to bind.
    pub hostname: String,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            hostname: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl ListenOptions {
    /// Listen on an OS-assigned port of the loopback interface.
    pub fn loopback() -> Self {
        Self {
            port: 0,
            hostname: "127.0.0.1".to_string(),
        }
    }
}
