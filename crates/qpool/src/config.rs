//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings consumed once, when the maintenance task is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of slots the maintenance task keeps allocated.
    pub size: usize,
    /// How long a freshly allocated resource is considered fresh.
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,
    /// Bounded wait on the dead queue between top-up checks.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Pause between empty polls while draining.
    #[serde(rename = "drain_backoff_ms", with = "millis")]
    pub drain_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            ttl: Duration::from_secs(600),
            poll_interval: Duration::from_millis(50),
            drain_backoff: Duration::from_millis(10),
        }
    }
}

impl PoolConfig {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_drain_backoff(mut self, backoff: Duration) -> Self {
        self.drain_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size < 1 {
            return Err(ConfigError::InvalidSize { size: self.size });
        }
        // A zero wait would turn both loops into busy spins.
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval {
                name: "poll_interval",
            });
        }
        if self.drain_backoff.is_zero() {
            return Err(ConfigError::ZeroInterval {
                name: "drain_backoff",
            });
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
