//! Configuration for connecting a memory store to its backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection and tuning settings for a memory database.
///
/// The connection string and database name are consumed by whichever
/// [`DocumentBackend`](crate::backend::DocumentBackend) implementation is
/// being constructed; the in-memory backend ignores them. Poll interval and
/// wait timeout govern index-readiness polling.
///
/// # Examples
///
/// ```
/// use engram::config::MemoryDbConfig;
///
/// let config = MemoryDbConfig::default()
///     .with_connection("mongodb://localhost:27017")
///     .with_database("memories");
/// assert_eq!(config.database_name, "memories");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDbConfig {
    /// Backend connection string.
    pub connection_string: String,
    /// Logical database name.
    pub database_name: String,
    /// Interval between index-readiness polls.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// How long `create_index` waits for the build before giving up silently.
    #[serde(with = "duration_millis")]
    pub create_wait_timeout: Duration,
}

impl Default for MemoryDbConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            database_name: "engram".to_string(),
            poll_interval: Duration::from_millis(100),
            create_wait_timeout: Duration::from_secs(60),
        }
    }
}

impl MemoryDbConfig {
    /// Set the backend connection string.
    pub fn with_connection<S: Into<String>>(mut self, connection_string: S) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Set the logical database name.
    pub fn with_database<S: Into<String>>(mut self, database_name: S) -> Self {
        self.database_name = database_name.into();
        self
    }

    /// Set the readiness poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the bounded wait applied after submitting an index build.
    pub fn with_create_wait_timeout(mut self, timeout: Duration) -> Self {
        self.create_wait_timeout = timeout;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MemoryDbConfig::default();
        assert_eq!(config.database_name, "engram");
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.create_wait_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builder_chain() {
        let config = MemoryDbConfig::default()
            .with_connection("mongodb://host")
            .with_database("km")
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(config.connection_string, "mongodb://host");
        assert_eq!(config.database_name, "km");
        assert_eq!(config.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = MemoryDbConfig::default().with_database("km");
        let json = serde_json::to_string(&config).unwrap();
        let back: MemoryDbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.database_name, "km");
        assert_eq!(back.poll_interval, config.poll_interval);
    }
}
