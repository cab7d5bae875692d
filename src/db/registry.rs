// Driver Registry
// Maps each database family to the adapter that serves it

use crate::config::CoreConfig;
use crate::db::drivers::{MongoDriver, SqliteDriver};
use crate::db::error::DatabaseError;
use crate::db::traits::{DatabaseDriver, DatabaseFamily};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Fixed family-to-driver table, built once when the dispatcher starts
pub struct DriverRegistry {
    drivers: HashMap<DatabaseFamily, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    /// Build a registry from a fixed set of drivers
    pub fn from_drivers(drivers: Vec<Arc<dyn DatabaseDriver>>) -> Self {
        let drivers = drivers
            .into_iter()
            .map(|driver| {
                debug!("Registered driver for: {:?}", driver.family());
                (driver.family(), driver)
            })
            .collect();
        Self { drivers }
    }

    /// SQLite and MongoDB adapters configured from `config`
    pub fn with_defaults(config: &CoreConfig) -> Self {
        Self::from_drivers(vec![
            Arc::new(SqliteDriver::with_options(config.sqlite.clone())),
            Arc::new(MongoDriver::with_options(config.mongodb.clone())),
        ])
    }

    /// Get a driver by family
    pub fn get_driver(
        &self,
        family: DatabaseFamily,
    ) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
        self.drivers
            .get(&family)
            .cloned()
            .ok_or_else(|| DatabaseError::Unsupported {
                scheme: family.schemes().join("|"),
            })
    }
}
