//! Relay tuning knobs.

use crate::error::{RelayError, RelayResult};
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration.
///
/// Durations are read as milliseconds when deserialized, e.g.
/// `poll_interval_ms: 3000`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How often the poll stage claims a batch. Also paces the publish and
    /// sweep stages.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,

    /// Capacity of the publish queue and of each outcome queue. A full
    /// publish queue blocks the poll stage.
    pub queue_capacity: usize,

    /// Outcome buffers are flushed to the store as soon as they hold this
    /// many ids.
    pub resolve_batch_size: usize,

    /// Partially filled outcome buffers are flushed at this interval.
    #[serde(rename = "resolve_flush_interval_ms", with = "millis")]
    pub resolve_flush_interval: Duration,

    /// Attempts for the final flush while shutting down.
    pub resolve_retry_limit: u32,

    /// Unlock rows locked for longer than this. Disabled when unset.
    ///
    /// Must comfortably exceed the time a message spends between claim and
    /// resolution, otherwise in-flight rows are handed to another relay.
    #[serde(rename = "stale_lock_after_ms", with = "millis_opt")]
    pub stale_lock_after: Option<Duration>,

    /// Bound on the drain phase of shutdown.
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            queue_capacity: 256,
            resolve_batch_size: 100,
            resolve_flush_interval: Duration::from_millis(250),
            resolve_retry_limit: 5,
            stale_lock_after: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> RelayResult<()> {
        if self.poll_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "poll interval must be non-zero".into(),
            ));
        }
        if self.resolve_flush_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "resolve flush interval must be non-zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.resolve_batch_size == 0 {
            return Err(RelayError::InvalidConfig(
                "resolve batch size must be at least 1".into(),
            ));
        }
        if self.resolve_retry_limit == 0 {
            return Err(RelayError::InvalidConfig(
                "resolve retry limit must be at least 1".into(),
            ));
        }
        if matches!(self.stale_lock_after, Some(d) if d.is_zero()) {
            return Err(RelayError::InvalidConfig(
                "stale lock threshold must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
