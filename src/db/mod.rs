// Database Module
// Connection strings, driver adapters, the session registry and result
// normalization

pub mod descriptor;
pub mod drivers;
pub mod error;
pub mod normalize;
pub mod registry;
pub mod sessions;
pub mod traits;

// ============================================================================
// Re-exports
// ============================================================================

pub use descriptor::{
    ConnectionDescriptor, ConnectionKey, HostAddr, MongoTarget, SqliteMode, SqliteTarget,
};
pub use drivers::{MongoDriver, SqliteDriver};
pub use error::{DatabaseError, DescriptorIssue, ErrorCategory, OpenFailure};
pub use normalize::{normalize, QueryResult, Row};
pub use registry::DriverRegistry;
pub use sessions::{ConnectionRegistry, Session, SessionInfo};
pub use traits::{CellValue, Connection, DatabaseDriver, DatabaseFamily, NativeResult, QueryParam};
