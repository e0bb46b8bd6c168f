//! Configuration for the WAL proposer
//!
//! Settings are merged from, in increasing precedence:
//! 1. Built-in defaults
//! 2. `walprop.toml` in the working directory, or an explicit file
//! 3. Environment variables (`WALPROP_*`, nested keys joined with `__`)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use walprop_types::{TenantId, TimelineId};

mod error;
mod loader;

pub use error::ConfigError;
pub use loader::ConfigLoader;

/// Largest number of acceptors a proposer can drive.
pub const MAX_SAFEKEEPERS: usize = 32;

const MB: u64 = 1024 * 1024;

/// Proposer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalProposerConfig {
    /// Comma-separated `host:port` list of acceptors.
    pub safekeepers: String,
    /// Delay before an offline acceptor is reconnected; `<= 0` disables
    /// reconnection.
    pub reconnect_timeout_ms: i64,
    /// A connection that received nothing for this long is reset; `<= 0`
    /// disables the check.
    pub connection_timeout_ms: i64,
    /// Run once to bring a quorum of acceptors to a common WAL end, then exit.
    pub sync_safekeepers: bool,
    pub system_id: u64,
    pub pg_version: u32,
    pub timeline: u32,
    pub timeline_id: TimelineId,
    pub tenant_id: TenantId,
    pub wal_segment_size: u32,
    pub backpressure: BackpressureConfig,
}

impl Default for WalProposerConfig {
    fn default() -> Self {
        Self {
            safekeepers: "127.0.0.1:5454".to_string(),
            reconnect_timeout_ms: 1_000,
            connection_timeout_ms: 10_000,
            sync_safekeepers: false,
            system_id: 0,
            pg_version: 160_000,
            timeline: 1,
            timeline_id: TimelineId::default(),
            tenant_id: TenantId::default(),
            wal_segment_size: 16 * 1024 * 1024,
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// Replication lag limits, in megabytes; zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_replication_write_lag_mb: u64,
    pub max_replication_flush_lag_mb: u64,
    pub max_replication_apply_lag_mb: u64,
}

impl BackpressureConfig {
    pub fn write_lag_bytes(&self) -> u64 {
        self.max_replication_write_lag_mb.saturating_mul(MB)
    }

    pub fn flush_lag_bytes(&self) -> u64 {
        self.max_replication_flush_lag_mb.saturating_mul(MB)
    }

    pub fn apply_lag_bytes(&self) -> u64 {
        self.max_replication_apply_lag_mb.saturating_mul(MB)
    }
}

impl WalProposerConfig {
    /// Parses a TOML document on top of the defaults.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Acceptor endpoints in configuration order.
    pub fn safekeeper_list(&self) -> Vec<String> {
        self.safekeepers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn reconnect_timeout(&self) -> Option<Duration> {
        positive_millis(self.reconnect_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        positive_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let safekeepers = self.safekeeper_list();
        if safekeepers.is_empty() {
            return Err(ConfigError::NoSafekeepers);
        }
        if safekeepers.len() > MAX_SAFEKEEPERS {
            return Err(ConfigError::TooManySafekeepers {
                count: safekeepers.len(),
                max: MAX_SAFEKEEPERS,
            });
        }
        for addr in &safekeepers {
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::InvalidSafekeeperAddress(addr.clone()));
            }
        }
        if !self.wal_segment_size.is_power_of_two() {
            return Err(ConfigError::InvalidSegmentSize(self.wal_segment_size));
        }
        Ok(())
    }
}

fn positive_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms)
        .ok()
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
}
