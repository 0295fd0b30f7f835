//! Configuration for the pool manager and datastore safety windows.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for the warm-pool reconciler and the datastore teardown windows.
///
/// All fields are plain seconds so the structure round-trips through flat
/// env/JSON configuration without custom parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Seconds between reconciler ticks
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Minimum ENI age before it becomes eligible for teardown
    #[serde(default = "default_min_eni_lifetime_secs")]
    pub min_eni_lifetime_secs: u64,

    /// Minimum quiet time after the last address release on an ENI before it
    /// becomes eligible for teardown
    #[serde(default = "default_address_cooling_secs")]
    pub address_cooling_secs: u64,

    /// Seconds between attempts to spot a freshly attached ENI in instance
    /// metadata
    #[serde(default = "default_eni_attach_wait_secs")]
    pub eni_attach_wait_secs: u64,

    /// How many times to poll instance metadata for a freshly attached ENI
    /// before abandoning the grow attempt
    #[serde(default = "default_max_eni_attach_checks")]
    pub max_eni_attach_checks: u32,

    /// Capacity of the pool-event channel
    ///
    /// When full, further events are dropped (with a warning log) rather
    /// than blocking the reconciler.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl PoolConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval_secs == 0 {
            return Err(Error::config("monitor interval must be > 0"));
        }
        if self.max_eni_attach_checks == 0 {
            return Err(Error::config("ENI attach checks must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::config("event channel capacity must be > 0"));
        }
        Ok(())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn min_eni_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_eni_lifetime_secs)
    }

    pub fn address_cooling(&self) -> Duration {
        Duration::from_secs(self.address_cooling_secs)
    }

    pub fn eni_attach_wait(&self) -> Duration {
        Duration::from_secs(self.eni_attach_wait_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval_secs(),
            min_eni_lifetime_secs: default_min_eni_lifetime_secs(),
            address_cooling_secs: default_address_cooling_secs(),
            eni_attach_wait_secs: default_eni_attach_wait_secs(),
            max_eni_attach_checks: default_max_eni_attach_checks(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_min_eni_lifetime_secs() -> u64 {
    60
}

fn default_address_cooling_secs() -> u64 {
    60
}

fn default_eni_attach_wait_secs() -> u64 {
    10
}

fn default_max_eni_attach_checks() -> u32 {
    5
}

fn default_event_channel_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PoolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.monitor_interval(), Duration::from_secs(5));
        assert_eq!(config.min_eni_lifetime(), Duration::from_secs(60));
        assert_eq!(config.address_cooling(), Duration::from_secs(60));
        assert_eq!(config.eni_attach_wait(), Duration::from_secs(10));
        assert_eq!(config.max_eni_attach_checks, 5);
    }

    #[test]
    fn zero_interval_rejected() {
        let config = PoolConfig {
            monitor_interval_secs: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
