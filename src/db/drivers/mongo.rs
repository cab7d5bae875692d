// MongoDB Driver
// Implements DatabaseDriver for the document-network family. Commands are
// JSON documents run through `runCommand` against the connection's database.

use crate::config::MongoOptions;
use crate::db::descriptor::ConnectionDescriptor;
use crate::db::error::{DatabaseError, OpenFailure};
use crate::db::traits::{
    downcast, Connection, DatabaseDriver, DatabaseFamily, NativeResult, QueryParam,
};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Characters MongoDB rejects in database names
const INVALID_NAME_CHARS: [char; 11] = ['/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|'];

/// Database names are limited to 64 bytes
const MAX_NAME_LEN: usize = 64;

/// MongoDB connection wrapper; the client pools connections internally
pub struct MongoConnection {
    pub id: String,
    client: Client,
    database: Database,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Connection for MongoConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.database.run_command(doc! { "ping": 1 }).await.is_ok()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// MongoDB driver implementation
pub struct MongoDriver {
    options: MongoOptions,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self::with_options(MongoOptions::default())
    }

    pub fn with_options(options: MongoOptions) -> Self {
        Self { options }
    }

    /// Validate a database name before any network traffic
    pub fn validate_database_name(name: &str) -> Result<(), DatabaseError> {
        if name.trim().is_empty() {
            return Err(DatabaseError::open_failed(
                OpenFailure::MissingDatabaseName,
                "Empty database name in connection string",
            ));
        }

        if let Some(c) = name
            .chars()
            .find(|c| INVALID_NAME_CHARS.contains(c) || *c == '?' || *c == '\0')
        {
            return Err(DatabaseError::open_failed(
                OpenFailure::InvalidNamespace,
                format!("Invalid database name '{}': '{}' is an invalid character in a db name", name, c),
            ));
        }

        if name.len() >= MAX_NAME_LEN {
            return Err(DatabaseError::open_failed(
                OpenFailure::InvalidNamespace,
                format!("Invalid database name '{}': must be shorter than {} bytes", name, MAX_NAME_LEN),
            ));
        }

        Ok(())
    }

    /// Parse the command text as a (possibly extended) JSON object, keeping
    /// key order since the first key names the command
    pub fn parse_command(text: &str) -> Result<Document, DatabaseError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| DatabaseError::rejected(format!("Invalid command document: {}", e)))?;

        match Bson::try_from(value) {
            Ok(Bson::Document(command)) if !command.is_empty() => Ok(command),
            Ok(Bson::Document(_)) => Err(DatabaseError::rejected("Command document is empty")),
            Ok(_) => Err(DatabaseError::rejected("Command must be a JSON object")),
            Err(e) => Err(DatabaseError::rejected(format!("Invalid command document: {}", e))),
        }
    }

    /// Fill in timeouts and app name the URI leaves unset
    fn apply_defaults(&self, client_options: &mut ClientOptions) {
        if client_options.connect_timeout.is_none() {
            client_options.connect_timeout =
                self.options.connect_timeout_ms.map(Duration::from_millis);
        }
        if client_options.server_selection_timeout.is_none() {
            client_options.server_selection_timeout = self
                .options
                .server_selection_timeout_ms
                .map(Duration::from_millis);
        }
        if client_options.app_name.is_none() {
            client_options.app_name = self.options.app_name.clone();
        }
    }
}

/// Collection and id of a cursor the server still holds open after a reply
fn open_cursor(reply: &Document) -> Option<(String, i64)> {
    let cursor = reply.get_document("cursor").ok()?;
    let id = match cursor.get("id")? {
        Bson::Int64(id) => *id,
        Bson::Int32(id) => i64::from(*id),
        _ => return None,
    };
    if id == 0 {
        return None;
    }
    let ns = cursor.get_str("ns").ok()?;
    let (_, collection) = ns.split_once('.')?;
    Some((collection.to_string(), id))
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for MongoDriver {
    fn family(&self) -> DatabaseFamily {
        DatabaseFamily::DocumentNetwork
    }

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>, DatabaseError> {
        let target = match descriptor {
            ConnectionDescriptor::Mongo(target) => target,
            _ => return Err(DatabaseError::internal("MongoDB driver got a non-MongoDB descriptor")),
        };

        Self::validate_database_name(&target.database)?;

        let redacted = descriptor.redacted();
        debug!("Creating MongoDB client for {}", redacted);

        let uri = descriptor.to_connection_string();
        let mut client_options = ClientOptions::parse(uri.as_str())
            .await
            .map_err(|e| {
                error!("Failed to parse MongoDB connection string {}: {}", redacted, e);
                DatabaseError::open_failed(
                    OpenFailure::Other,
                    format!("Failed to parse MongoDB connection string: {}", e),
                )
            })?;
        self.apply_defaults(&mut client_options);

        let client = Client::with_options(client_options).map_err(|e| {
            error!("Failed to create MongoDB client: {}", e);
            DatabaseError::open_failed(
                OpenFailure::Other,
                format!("Failed to create MongoDB client: {}", e),
            )
        })?;

        let database = client.database(&target.database);

        // Handshake and authenticate by running a cheap command
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                error!("Failed to connect to MongoDB {}: {}", redacted, e);
                DatabaseError::open_failed(
                    OpenFailure::Other,
                    format!("Failed to connect to MongoDB: {}", e),
                )
            })?;

        let connection = MongoConnection {
            id: uuid::Uuid::new_v4().to_string(),
            client,
            database,
            closed: AtomicBool::new(false),
        };
        debug!(connection_id = %connection.id, "MongoDB client connected");
        Ok(Box::new(connection))
    }

    async fn execute(
        &self,
        conn: &dyn Connection,
        text: &str,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError> {
        let mongo_conn = downcast::<MongoConnection>(conn)?;
        if mongo_conn.closed.load(Ordering::SeqCst) {
            return Err(DatabaseError::rejected("connection is closed"));
        }

        if !params.is_empty() {
            warn!(
                count = params.len(),
                "Positional parameters are ignored for MongoDB commands"
            );
        }

        let command = Self::parse_command(text)?;
        let reply = mongo_conn.database.run_command(command).await?;

        // Only the first batch is returned, so release the rest server-side
        if let Some((collection, cursor_id)) = open_cursor(&reply) {
            let kill = doc! { "killCursors": collection.as_str(), "cursors": [cursor_id] };
            if let Err(e) = mongo_conn.database.run_command(kill).await {
                warn!(connection_id = %mongo_conn.id, "Failed to kill cursor {} on {}: {}", cursor_id, collection, e);
            }
        }

        Ok(NativeResult::Document(reply))
    }

    async fn close(&self, conn: &dyn Connection) -> Result<(), DatabaseError> {
        let mongo_conn = downcast::<MongoConnection>(conn)?;
        if mongo_conn.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(connection_id = %mongo_conn.id, "Closing MongoDB client");
        let timeout = Duration::from_millis(self.options.close_timeout_ms);
        let shutdown = mongo_conn.client.clone().shutdown().into_future();

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    connection_id = %mongo_conn.id,
                    "MongoDB shutdown did not finish within {}ms", self.options.close_timeout_ms
                );
                Err(DatabaseError::internal(
                    "timed out waiting for MongoDB operations to finish",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::normalize::{normalize, QueryResult};

    #[test]
    fn test_driver_family() {
        let driver = MongoDriver::new();
        assert_eq!(driver.family(), DatabaseFamily::DocumentNetwork);
        assert_eq!(driver.driver_name(), "MongoDB");
    }

    #[test]
    fn test_database_name_validation() {
        assert!(MongoDriver::validate_database_name("testdb").is_ok());
        assert!(MongoDriver::validate_database_name("my_db-2").is_ok());

        let err = MongoDriver::validate_database_name("").unwrap_err();
        assert_eq!(err.open_cause(), Some(OpenFailure::MissingDatabaseName));

        for bad in ["my.db", "a b", "x$y", "we/ird", "q?"] {
            let err = MongoDriver::validate_database_name(bad).unwrap_err();
            assert_eq!(err.open_cause(), Some(OpenFailure::InvalidNamespace), "{}", bad);
        }

        let long = "d".repeat(64);
        let err = MongoDriver::validate_database_name(&long).unwrap_err();
        assert_eq!(err.open_cause(), Some(OpenFailure::InvalidNamespace));
    }

    #[test]
    fn test_parse_command_keeps_key_order() {
        let command = MongoDriver::parse_command(r#"{"find": "users", "filter": {"age": {"$gt": 21}}, "limit": 5}"#)
            .unwrap();
        let keys: Vec<&String> = command.keys().collect();
        assert_eq!(keys, vec!["find", "filter", "limit"]);
        assert_eq!(command.get_str("find").unwrap(), "users");
    }

    #[test]
    fn test_parse_command_extended_json() {
        let command =
            MongoDriver::parse_command(r#"{"find": "c", "filter": {"_id": {"$oid": "507f1f77bcf86cd799439011"}}}"#)
                .unwrap();
        let filter = command.get_document("filter").unwrap();
        assert!(matches!(filter.get("_id"), Some(Bson::ObjectId(_))));
    }

    #[test]
    fn test_parse_command_rejects_bad_input() {
        for bad in ["not json", "[1, 2]", "{}", "42"] {
            let err = MongoDriver::parse_command(bad).unwrap_err();
            assert!(matches!(err, DatabaseError::DriverRejected { .. }), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_invalid_namespace_fails_before_network() {
        let driver = MongoDriver::new();
        let descriptor = ConnectionDescriptor::parse("mongodb://localhost:1/bad.name").unwrap();

        let err = driver.connect(&descriptor).await.err().unwrap();
        assert_eq!(err.open_cause(), Some(OpenFailure::InvalidNamespace));
    }

    #[test]
    fn test_open_cursor_detection() {
        let open = doc! {
            "cursor": { "id": 8_675_309_i64, "ns": "app.users", "firstBatch": [ { "x": 1 } ] },
            "ok": 1.0,
        };
        assert_eq!(open_cursor(&open), Some(("users".to_string(), 8_675_309)));

        let listing = doc! {
            "cursor": { "id": 42_i64, "ns": "app.$cmd.listCollections", "firstBatch": [] },
            "ok": 1.0,
        };
        assert_eq!(open_cursor(&listing), Some(("$cmd.listCollections".to_string(), 42)));

        let exhausted = doc! {
            "cursor": { "id": 0_i64, "ns": "app.users", "firstBatch": [] },
            "ok": 1.0,
        };
        assert_eq!(open_cursor(&exhausted), None);
        assert_eq!(open_cursor(&doc! { "n": 1, "ok": 1.0 }), None);
    }

    /// Nothing listens on port 1, so server selection fails fast
    const UNREACHABLE: &str = "mongodb://127.0.0.1:1/testdb?serverSelectionTimeoutMS=300";

    #[tokio::test]
    async fn test_unreachable_server_is_connection_refused() {
        let driver = MongoDriver::new();
        let descriptor = ConnectionDescriptor::parse(UNREACHABLE).unwrap();

        let err = driver.connect(&descriptor).await.err().unwrap().classify();
        assert_eq!(err.open_cause(), Some(OpenFailure::ConnectionRefused));
        assert!(err.is_connection_error());
        assert!(err.hint().is_some());
    }

    #[tokio::test]
    async fn test_server_lost_during_query_is_connection_error() {
        // A client that never reached the server stands in for one that went away
        let client_options = ClientOptions::parse(UNREACHABLE).await.unwrap();
        let client = Client::with_options(client_options).unwrap();
        let conn = MongoConnection {
            id: "lost".to_string(),
            database: client.database("testdb"),
            client,
            closed: AtomicBool::new(false),
        };
        let driver = MongoDriver::new();

        let err = driver
            .execute(&conn, r#"{"ping": 1}"#, &[])
            .await
            .unwrap_err()
            .classify();

        assert_eq!(err.open_cause(), Some(OpenFailure::ConnectionRefused));
        assert!(err.is_connection_error());
        assert_eq!(err.kind(), "openFailed");
    }

    /// Needs a live server, e.g.
    /// `DBCONN_TEST_MONGODB_URL=mongodb://localhost:27017 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_list_collections_live() {
        let base = std::env::var("DBCONN_TEST_MONGODB_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let db_name = format!("dbconn_test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let descriptor =
            ConnectionDescriptor::parse(&format!("{}/{}", base.trim_end_matches('/'), db_name)).unwrap();

        let driver = MongoDriver::new();
        let conn = driver.connect(&descriptor).await.unwrap();
        for name in ["a", "b"] {
            driver
                .execute(conn.as_ref(), &format!(r#"{{"create": "{}"}}"#, name), &[])
                .await
                .unwrap();
        }

        let native = driver
            .execute(conn.as_ref(), r#"{"listCollections": 1}"#, &[])
            .await
            .unwrap();
        match normalize(native, DatabaseFamily::DocumentNetwork) {
            QueryResult::Rows { rows, .. } => {
                let mut names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
                names.sort();
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = driver
            .execute(conn.as_ref(), r#"{"notARealCommand": 1}"#, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::DriverRejected { .. }));

        driver
            .execute(conn.as_ref(), r#"{"dropDatabase": 1}"#, &[])
            .await
            .unwrap();
        driver.close(conn.as_ref()).await.unwrap();
        assert!(!conn.is_alive().await);
    }
}
