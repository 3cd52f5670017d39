//! Topology options.
//!
//! Options are plain data with defaults for everything except the set name
//! and seed list. They can be built in code or loaded from TOML, and are
//! checked once by [`TopologyOptions::validate`] before a topology is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;
use crate::error::ConfigError;

/// Options for one replica set topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyOptions {
    /// Name of the replica set. Replies carrying any other name are
    /// treated as coming from outside the set.
    pub set_name: String,
    /// Seed addresses, `host` or `host:port`.
    pub seeds: Vec<String>,
    pub heartbeat_frequency_ms: u64,
    /// Re-probe delay after a failed heartbeat, and the floor between two
    /// probes of the same member.
    pub min_heartbeat_frequency_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// How long the initial connect may take before it fails.
    pub connect_timeout_ms: u64,
    /// Acceptable latency window for `Nearest` reads.
    pub local_threshold_ms: u64,
    /// Treat the set as connected once a secondary answers, even with no
    /// primary.
    pub secondary_only_connection_allowed: bool,
    /// Fail the initial connect when a seed reports a different set name.
    pub strict_set_name: bool,
    /// Consecutive failed heartbeats before a member is dropped. Failures
    /// during the initial connect never drop a member.
    pub max_heartbeat_failures: u32,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Capacity of the monitor report queue.
    pub report_capacity: usize,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            set_name: String::new(),
            seeds: Vec::new(),
            heartbeat_frequency_ms: 10_000,
            min_heartbeat_frequency_ms: 500,
            heartbeat_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            local_threshold_ms: 15,
            secondary_only_connection_allowed: false,
            strict_set_name: false,
            max_heartbeat_failures: 3,
            event_capacity: 256,
            report_capacity: 256,
        }
    }
}

impl TopologyOptions {
    /// Options for `set_name` seeded with `seeds`, everything else default.
    pub fn new<S: Into<String>>(set_name: impl Into<String>, seeds: impl IntoIterator<Item = S>) -> Self {
        Self {
            set_name: set_name.into(),
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses options from a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Checks every field and returns the parsed, de-duplicated seed list.
    pub fn validate(&self) -> Result<Vec<ServerAddress>, ConfigError> {
        if self.set_name.trim().is_empty() {
            return Err(ConfigError::MissingSetName);
        }
        if self.seeds.is_empty() {
            return Err(ConfigError::EmptySeedList);
        }

        let mut seeds = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            let address = ServerAddress::parse(seed).map_err(|source| ConfigError::InvalidSeed {
                seed: seed.clone(),
                source,
            })?;
            if !seeds.contains(&address) {
                seeds.push(address);
            }
        }

        if self.heartbeat_frequency_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_frequency_ms must be greater than zero".into(),
            ));
        }
        if self.min_heartbeat_frequency_ms == 0
            || self.min_heartbeat_frequency_ms > self.heartbeat_frequency_ms
        {
            return Err(ConfigError::InvalidValue(format!(
                "min_heartbeat_frequency_ms must be between 1 and {}",
                self.heartbeat_frequency_ms
            )));
        }
        if self.heartbeat_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "timeouts must be greater than zero".into(),
            ));
        }
        if self.max_heartbeat_failures == 0 {
            return Err(ConfigError::InvalidValue(
                "max_heartbeat_failures must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 || self.report_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "channel capacities must be greater than zero".into(),
            ));
        }

        Ok(seeds)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }
}
