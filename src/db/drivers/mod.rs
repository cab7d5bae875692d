// Database Drivers
// One adapter per supported database family

pub mod mongo;
pub mod sqlite;

// Re-export drivers
pub use mongo::MongoDriver;
pub use sqlite::SqliteDriver;
