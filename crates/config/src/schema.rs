//! Config schema types for the storage provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest retention window accepted by validation (one day).
pub const MIN_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobstoreConfig {
    pub storage: StorageConfig,
}

/// Storage provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection URL, e.g. `sqlite://jobstore.db?mode=rwc`.
    pub connection_string: String,
    /// Age after which finished runs are swept. `None` disables retention.
    pub retention_secs: Option<u64>,
    /// How often the retention sweeper wakes up. Default 3600.
    pub retention_interval_secs: u64,
    /// Create missing tables on startup.
    pub auto_create_schema: bool,
    /// Connection pool ceiling. Default 5.
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            retention_secs: None,
            retention_interval_secs: default_retention_interval_secs(),
            auto_create_schema: true,
            max_connections: default_max_connections(),
        }
    }
}

impl StorageConfig {
    /// Shorthand for a config pointing at `connection_string` with defaults
    /// for everything else.
    #[must_use]
    pub fn with_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_max_connections() -> u32 {
    5
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = StorageConfig::default();
        assert!(cfg.connection_string.is_empty());
        assert!(cfg.retention().is_none());
        assert_eq!(cfg.retention_interval(), Duration::from_secs(3600));
        assert!(cfg.auto_create_schema);
        assert_eq!(cfg.max_connections, 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: JobstoreConfig = toml::from_str(
            r#"
            [storage]
            connection_string = "sqlite::memory:"
            retention_secs = 172800
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.connection_string, "sqlite::memory:");
        assert_eq!(cfg.storage.retention(), Some(Duration::from_secs(172_800)));
        assert_eq!(cfg.storage.max_connections, 5);
    }
}
