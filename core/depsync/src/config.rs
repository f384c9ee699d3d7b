//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Devices requested per fetch page.
    pub fetch_limit: u32,
    /// Pause between two sync calls.
    #[serde(with = "secs")]
    pub sync_interval: Duration,
    /// Saved cursors older than this are discarded at startup.
    #[serde(with = "secs")]
    pub cursor_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 100,
            sync_interval: Duration::from_secs(30 * 60),
            cursor_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SyncConfig {
    /// Set the fetch page size.
    pub fn with_fetch_limit(mut self, limit: u32) -> Self {
        self.fetch_limit = limit;
        self
    }

    /// Set the sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the maximum cursor age.
    pub fn with_cursor_max_age(mut self, max_age: Duration) -> Self {
        self.cursor_max_age = max_age;
        self
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.fetch_limit, 100);
        assert_eq!(config.sync_interval, Duration::from_secs(1800));
        assert_eq!(config.cursor_max_age.as_secs(), 604_800);
    }

    #[test]
    fn test_partial_json() {
        let config: SyncConfig = serde_json::from_str(r#"{"sync_interval": 60}"#).unwrap();
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.fetch_limit, 100);
    }
}
