// Database Driver Traits
// Defines the adapter abstraction every database family implements

use crate::db::descriptor::ConnectionDescriptor;
use crate::db::error::DatabaseError;
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};

/// Supported database families
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseFamily {
    /// File-backed relational engine (SQLite)
    RelationalFile,
    /// Networked document store (MongoDB)
    DocumentNetwork,
}

impl DatabaseFamily {
    /// Display name for UI
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseFamily::RelationalFile => "SQLite",
            DatabaseFamily::DocumentNetwork => "MongoDB",
        }
    }

    /// Connection string scheme(s) this family answers to
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            DatabaseFamily::RelationalFile => &["sqlite"],
            DatabaseFamily::DocumentNetwork => &["mongodb", "mongodb+srv"],
        }
    }

    pub fn from_scheme(scheme: &str) -> Option<Self> {
        [DatabaseFamily::RelationalFile, DatabaseFamily::DocumentNetwork]
            .into_iter()
            .find(|family| family.schemes().contains(&scheme))
    }
}

/// Positional query parameter, forwarded to the driver untouched
pub type QueryParam = serde_json::Value;

/// Cell value in a relational result set
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    /// Integer stored in a column declared BOOLEAN
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
}

/// Family-native result, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum NativeResult {
    /// Statement produced a result set; columns in driver-declared order
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<CellValue>>,
    },
    /// Statement had no result set
    Affected {
        rows_affected: u64,
        last_insert_rowid: i64,
    },
    /// Raw reply to a document command
    Document(Document),
}

/// Connection trait - every live session handle implements this
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection ID
    fn connection_id(&self) -> &str;

    /// Test if the connection is alive
    async fn is_alive(&self) -> bool;

    /// Allow downcasting for driver-specific operations
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Database driver trait - one implementation per family
#[async_trait::async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Get the family this driver serves
    fn family(&self) -> DatabaseFamily;

    /// Get the display name for this driver
    fn driver_name(&self) -> &'static str {
        self.family().display_name()
    }

    /// Establish the underlying connection or pool
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>, DatabaseError>;

    /// Run a raw query or command; params bind positionally where supported
    async fn execute(
        &self,
        conn: &dyn Connection,
        text: &str,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError>;

    /// Release the underlying resources. Must tolerate broken connections.
    async fn close(&self, conn: &dyn Connection) -> Result<(), DatabaseError>;
}

/// Downcast a session handle to the driver's own connection type
pub(crate) fn downcast<T: 'static>(conn: &dyn Connection) -> Result<&T, DatabaseError> {
    conn.as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| DatabaseError::internal("connection belongs to a different driver"))
}
