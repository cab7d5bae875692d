// Core Configuration
// Tunables for the dispatcher and the driver adapters. Every field has a
// default, so an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Abort a query after this long; `None` waits for the driver
    pub query_timeout_ms: Option<u64>,
    /// Close sessions unused for this long; `None` keeps them until `close`
    pub idle_timeout_secs: Option<u64>,
    /// How often the idle reaper runs when idle eviction is enabled
    pub idle_sweep_interval_secs: u64,
    pub sqlite: SqliteOptions,
    pub mongodb: MongoOptions,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: None,
            idle_timeout_secs: None,
            idle_sweep_interval_secs: 60,
            sqlite: SqliteOptions::default(),
            mongodb: MongoOptions::default(),
        }
    }
}

impl CoreConfig {
    /// Parse a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs.max(1))
    }
}

/// SQLite adapter options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SqliteOptions {
    /// How long a statement waits on a locked database file
    pub busy_timeout_ms: u64,
    /// Create the file when it does not exist (only for the default mode)
    pub create_if_missing: bool,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            create_if_missing: true,
        }
    }
}

/// MongoDB adapter options, applied only when the URI leaves them unset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MongoOptions {
    pub connect_timeout_ms: Option<u64>,
    pub server_selection_timeout_ms: Option<u64>,
    /// Upper bound on waiting for in-flight operations when closing
    pub close_timeout_ms: u64,
    pub app_name: Option<String>,
}

impl Default for MongoOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Some(10_000),
            server_selection_timeout_ms: Some(10_000),
            close_timeout_ms: 5_000,
            app_name: None,
        }
    }
}
