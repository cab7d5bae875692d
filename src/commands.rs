// Command Dispatcher
// The load / close / query surface handed to the UI. Every failure leaves
// here classified, so callers can branch on a stable kind.

use crate::config::CoreConfig;
use crate::db::{
    normalize, ConnectionDescriptor, ConnectionRegistry, DatabaseError, DatabaseFamily,
    DriverRegistry, QueryParam, QueryResult, Session, SessionInfo,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Reply to a successful `load`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAck {
    pub session_id: String,
    pub family: DatabaseFamily,
    /// Connection string with credentials masked
    pub target: String,
}

/// Normalized result plus the figures a query-history store records
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    #[serde(flatten)]
    pub result: QueryResult,
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// Routes commands to sessions in the connection registry
pub struct Dispatcher {
    registry: ConnectionRegistry,
    config: CoreConfig,
}

impl Dispatcher {
    /// Dispatcher with the SQLite and MongoDB adapters
    pub fn new(config: CoreConfig) -> Self {
        let drivers = DriverRegistry::with_defaults(&config);
        Self::with_drivers(drivers, config)
    }

    pub fn with_drivers(drivers: DriverRegistry, config: CoreConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(Arc::new(drivers)),
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Start the idle reaper if idle eviction is configured.
    /// Must be called from within a tokio runtime.
    pub fn start_idle_reaper(&self) -> Option<JoinHandle<()>> {
        let max_idle = self.config.idle_timeout()?;
        info!(
            "Idle sessions close after {}s (sweep every {}s)",
            max_idle.as_secs(),
            self.config.idle_sweep_interval().as_secs()
        );
        Some(
            self.registry
                .spawn_idle_reaper(self.config.idle_sweep_interval(), max_idle),
        )
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Open (or reuse) the session for `connection`
    pub async fn load(&self, connection: &str) -> Result<LoadAck, DatabaseError> {
        let session = self.open(connection).await?;
        Ok(LoadAck {
            session_id: session.id().to_string(),
            family: session.family(),
            target: session.target().to_string(),
        })
    }

    /// Close one session, or all of them when `connection` is `None`.
    /// Returns whether anything was open; never fails.
    pub async fn close(&self, connection: Option<&str>) -> bool {
        let Some(raw) = connection else {
            return self.registry.release_all().await;
        };

        match ConnectionDescriptor::parse(raw) {
            Ok(descriptor) => self.registry.release(&descriptor.key()).await,
            Err(e) => {
                debug!("Ignoring close of unparseable connection string: {}", e);
                false
            }
        }
    }

    /// Run `text` on the session for `connection`, opening it on demand
    pub async fn query(
        &self,
        connection: &str,
        text: &str,
        params: &[QueryParam],
    ) -> Result<QueryOutcome, DatabaseError> {
        let session = self.open(connection).await?;

        let start = Instant::now();
        let native = match self.config.query_timeout() {
            // Dropping the execute future on expiry aborts the statement
            // where the driver supports it
            Some(limit) => match tokio::time::timeout(limit, session.execute(text, params)).await {
                Ok(result) => result,
                Err(_) => Err(DatabaseError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }),
            },
            None => session.execute(text, params).await,
        };
        let execution_time_ms = start.elapsed().as_millis() as u64;

        let native = native.map_err(|e| {
            debug!("Query on {} failed after {}ms: {}", session.target(), execution_time_ms, e);
            e.classify()
        })?;

        let result = normalize(native, session.family());
        debug!(
            "Query on {} returned {} row(s) in {}ms",
            session.target(),
            result.row_count(),
            execution_time_ms
        );

        Ok(QueryOutcome {
            row_count: result.row_count(),
            execution_time_ms,
            result,
        })
    }

    /// Whether `connection` has an open session that answers a liveness check
    pub async fn health(&self, connection: &str) -> bool {
        let Ok(descriptor) = ConnectionDescriptor::parse(connection) else {
            return false;
        };
        match self.registry.get(&descriptor.key()) {
            Some(session) => session.is_alive().await,
            None => false,
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.sessions()
    }

    async fn open(&self, connection: &str) -> Result<Arc<Session>, DatabaseError> {
        let descriptor = ConnectionDescriptor::parse(connection).map_err(DatabaseError::classify)?;
        self.registry
            .resolve(&descriptor)
            .await
            .map_err(DatabaseError::classify)
    }
}

// ============================================================================
// Tauri IPC
// ============================================================================

#[cfg(feature = "tauri")]
pub mod ipc {
    use super::{Dispatcher, LoadAck, QueryOutcome};
    use crate::db::{DatabaseError, SessionInfo};
    use serde_json::Value as JsonValue;
    use tauri::{command, State};

    #[command]
    pub async fn load(
        dispatcher: State<'_, Dispatcher>,
        db: String,
    ) -> Result<LoadAck, DatabaseError> {
        dispatcher.load(&db).await
    }

    #[command]
    pub async fn close(
        dispatcher: State<'_, Dispatcher>,
        db: Option<String>,
    ) -> Result<bool, DatabaseError> {
        Ok(dispatcher.close(db.as_deref()).await)
    }

    #[command]
    pub async fn query(
        dispatcher: State<'_, Dispatcher>,
        db: String,
        query: String,
        values: Vec<JsonValue>,
    ) -> Result<QueryOutcome, DatabaseError> {
        dispatcher.query(&db, &query, &values).await
    }

    #[command]
    pub async fn health(
        dispatcher: State<'_, Dispatcher>,
        db: String,
    ) -> Result<bool, DatabaseError> {
        Ok(dispatcher.health(&db).await)
    }

    #[command]
    pub async fn sessions(
        dispatcher: State<'_, Dispatcher>,
    ) -> Result<Vec<SessionInfo>, DatabaseError> {
        Ok(dispatcher.sessions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        Connection, DatabaseDriver, DescriptorIssue, NativeResult, OpenFailure, SqliteDriver,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// SQLite adapter that counts physical opens
    struct CountingDriver {
        inner: SqliteDriver,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl DatabaseDriver for CountingDriver {
        fn family(&self) -> DatabaseFamily {
            self.inner.family()
        }

        async fn connect(
            &self,
            descriptor: &ConnectionDescriptor,
        ) -> Result<Box<dyn Connection>, DatabaseError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.connect(descriptor).await
        }

        async fn execute(
            &self,
            conn: &dyn Connection,
            text: &str,
            params: &[QueryParam],
        ) -> Result<NativeResult, DatabaseError> {
            self.inner.execute(conn, text, params).await
        }

        async fn close(&self, conn: &dyn Connection) -> Result<(), DatabaseError> {
            self.inner.close(conn).await
        }
    }

    fn counting_dispatcher(config: CoreConfig) -> (Dispatcher, Arc<CountingDriver>) {
        let driver = Arc::new(CountingDriver {
            inner: SqliteDriver::new(),
            opens: AtomicUsize::new(0),
        });
        let shared: Arc<dyn DatabaseDriver> = driver.clone();
        let dispatcher = Dispatcher::with_drivers(DriverRegistry::from_drivers(vec![shared]), config);
        (dispatcher, driver)
    }

    fn sqlite_url(dir: &TempDir, name: &str) -> String {
        format!("sqlite:{}", dir.path().join(name).display())
    }

    #[tokio::test]
    async fn test_load_then_query_opens_once() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "app.db");
        let (dispatcher, driver) = counting_dispatcher(CoreConfig::default());

        let ack = dispatcher.load(&url).await.unwrap();
        assert_eq!(ack.family, DatabaseFamily::RelationalFile);

        let outcome = dispatcher.query(&url, "SELECT 1 AS one", &[]).await.unwrap();
        assert_eq!(outcome.row_count, 1);
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);

        // Reload of the same target is a no-op
        let again = dispatcher.load(&url).await.unwrap();
        assert_eq!(again.session_id, ack.session_id);
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_opens_on_demand() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "lazy.db");
        let (dispatcher, driver) = counting_dispatcher(CoreConfig::default());

        dispatcher
            .query(&url, "CREATE TABLE t (a INTEGER, b TEXT)", &[])
            .await
            .unwrap();
        let outcome = dispatcher
            .query(&url, "INSERT INTO t (a, b) VALUES (?, ?)", &[json!(1), json!("x")])
            .await
            .unwrap();

        assert_eq!(outcome.row_count, 0);
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["kind"], "rows");
        assert_eq!(wire["rowsAffected"], 1);
        assert_eq!(wire["rowCount"], 0);
        assert!(wire["executionTimeMs"].is_u64());
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_column_order_and_nulls() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "order.db");
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        let outcome = dispatcher
            .query(&url, "SELECT 2 AS b, NULL AS a", &[])
            .await
            .unwrap();

        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["columns"], json!(["b", "a"]));
        assert_eq!(wire["rows"][0]["b"], 2);
        assert!(wire["rows"][0]["a"].is_null());
        let keys: Vec<&String> = outcome.result.rows()[0].keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_double_close() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "close.db");
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        dispatcher.load(&url).await.unwrap();
        assert!(dispatcher.close(Some(url.as_str())).await);
        assert!(!dispatcher.close(Some(url.as_str())).await);
        assert!(!dispatcher.close(Some("not a connection string")).await);
        assert!(dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        dispatcher.load(&sqlite_url(&dir, "one.db")).await.unwrap();
        dispatcher.load(&sqlite_url(&dir, "two.db")).await.unwrap();
        assert_eq!(dispatcher.sessions().len(), 2);

        assert!(dispatcher.close(None).await);
        assert!(dispatcher.sessions().is_empty());
        assert!(!dispatcher.close(None).await);
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_one_open() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "busy.db");
        let (dispatcher, driver) = counting_dispatcher(CoreConfig::default());
        let dispatcher = Arc::new(dispatcher);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                let url = url.clone();
                tokio::spawn(async move {
                    dispatcher
                        .query(&url, "SELECT ? AS n", &[json!(i)])
                        .await
                        .map(|outcome| outcome.row_count)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_parent_directory() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nope").join("x.db").display());
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        let err = dispatcher.load(&url).await.unwrap_err();
        assert_eq!(err.open_cause(), Some(OpenFailure::ParentDirectoryMissing));
        assert!(err.is_connection_error());
        assert!(dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_is_verbatim() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "tables.db");
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        let err = dispatcher
            .query(&url, "SELECT * FROM missing", &[])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "driverRejected");
        assert!(err.to_string().contains("no such table: missing"));
        assert!(!err.is_connection_error());
    }

    #[tokio::test]
    async fn test_mongo_without_database_name() {
        let dispatcher = Dispatcher::new(CoreConfig::default());

        let err = dispatcher.load("mongodb://localhost:27017").await.unwrap_err();
        assert_eq!(err.descriptor_issue(), Some(DescriptorIssue::MissingDatabaseName));
        assert!(dispatcher.sessions().is_empty());

        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["kind"], "invalidDescriptor");
        assert_eq!(wire["category"], "connection");
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let dispatcher = Dispatcher::new(CoreConfig::default());

        let err = dispatcher.load("postgres://localhost/app").await.unwrap_err();
        assert_eq!(err.kind(), "unsupported");
    }

    #[tokio::test]
    async fn test_query_timeout_frees_session() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "slow.db");
        let config = CoreConfig {
            query_timeout_ms: Some(100),
            ..CoreConfig::default()
        };
        let (dispatcher, _driver) = counting_dispatcher(config);

        let endless = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                       SELECT count(*) FROM c";
        let err = dispatcher.query(&url, endless, &[]).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        // The interrupted statement releases the connection
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            dispatcher.query(&url, "SELECT 1", &[]),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome.row_count, 1);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "health.db");
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        assert!(!dispatcher.health(&url).await);
        dispatcher.load(&url).await.unwrap();
        assert!(dispatcher.health(&url).await);
        assert!(!dispatcher.health("garbage").await);

        dispatcher.close(Some(url.as_str())).await;
        assert!(!dispatcher.health(&url).await);
    }

    #[tokio::test]
    async fn test_memory_database() {
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        dispatcher
            .query("sqlite::memory:", "CREATE TABLE t (v TEXT)", &[])
            .await
            .unwrap();
        dispatcher
            .query("sqlite::memory:", "INSERT INTO t VALUES ('kept')", &[])
            .await
            .unwrap();
        let outcome = dispatcher
            .query("sqlite::memory:", "SELECT v FROM t", &[])
            .await
            .unwrap();

        assert_eq!(outcome.result.rows()[0]["v"], "kept");
    }

    #[tokio::test]
    async fn test_script_runs_every_statement() {
        let dir = TempDir::new().unwrap();
        let url = sqlite_url(&dir, "script.db");
        let (dispatcher, _driver) = counting_dispatcher(CoreConfig::default());

        let outcome = dispatcher
            .query(
                &url,
                "CREATE TABLE a (x BOOLEAN); CREATE TABLE b (y); INSERT INTO a VALUES (?); SELECT x FROM a",
                &[json!(true)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.result.rows()[0]["x"], true);

        let tables = dispatcher
            .query(&url, "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name", &[])
            .await
            .unwrap();
        assert_eq!(tables.row_count, 2);
    }
}
