// SQLite Driver
// Implements DatabaseDriver for the relational-file family using rusqlite

use crate::config::SqliteOptions;
use crate::db::descriptor::{ConnectionDescriptor, SqliteMode, SqliteTarget};
use crate::db::error::{DatabaseError, OpenFailure};
use crate::db::traits::{
    downcast, CellValue, Connection, DatabaseDriver, DatabaseFamily, NativeResult, QueryParam,
};
use chrono::DateTime;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{
    Batch, Connection as RusqliteConnection, ErrorCode, InterruptHandle, OpenFlags, Statement,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{debug, warn};

/// SQLite specific connection wrapper.
///
/// rusqlite connections are not `Sync`, so statements on one session are
/// serialized by the async mutex. `None` once the session has been closed.
pub struct SqliteConnection {
    pub id: String,
    conn: Arc<tokio::sync::Mutex<Option<RusqliteConnection>>>,
    interrupt: InterruptHandle,
    running: Arc<StdMutex<Option<u64>>>,
    tickets: AtomicU64,
}

impl SqliteConnection {
    fn new(id: String, conn: RusqliteConnection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            id,
            conn: Arc::new(tokio::sync::Mutex::new(Some(conn))),
            interrupt,
            running: Arc::new(StdMutex::new(None)),
            tickets: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Connection for SqliteConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    async fn is_alive(&self) -> bool {
        match self.conn.lock().await.as_ref() {
            Some(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            None => false,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Interrupts the statement of one execute call if its future is dropped
/// while the statement is still running
struct InterruptOnDrop<'a> {
    conn: &'a SqliteConnection,
    ticket: u64,
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for InterruptOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let running = self
            .conn
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.abandoned.store(true, Ordering::SeqCst);
        if *running == Some(self.ticket) {
            debug!(connection_id = %self.conn.id, "Interrupting abandoned SQLite statement");
            self.conn.interrupt.interrupt();
        }
    }
}

/// SQLite driver implementation
pub struct SqliteDriver {
    options: SqliteOptions,
}

impl SqliteDriver {
    /// Create a new SQLite driver
    pub fn new() -> Self {
        Self::with_options(SqliteOptions::default())
    }

    pub fn with_options(options: SqliteOptions) -> Self {
        Self { options }
    }

    /// Check the target path before handing it to SQLite so the common
    /// failures get a precise cause
    fn validate_path(target: &SqliteTarget, create_if_missing: bool) -> Result<(), DatabaseError> {
        if target.is_memory() {
            return Ok(());
        }

        let path = Path::new(&target.path);
        if path.file_name().is_none() {
            return Err(DatabaseError::open_failed(
                OpenFailure::InvalidPath,
                format!("'{}' does not name a database file", target.path),
            ));
        }

        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(DatabaseError::open_failed(
                    OpenFailure::InvalidPath,
                    format!("'{}' is a directory", target.path),
                ));
            }
            Ok(meta) => {
                if target.mode.is_writable() && meta.permissions().readonly() {
                    return Err(DatabaseError::open_failed(
                        OpenFailure::NoWritePermission,
                        format!("database file '{}' is read-only", target.path),
                    ));
                }
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_open_error(&target.path, e)),
        }

        if target.mode != SqliteMode::ReadWriteCreate || !create_if_missing {
            return Err(DatabaseError::open_failed(
                OpenFailure::InvalidPath,
                format!("database file '{}' does not exist", target.path),
            ));
        }

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        match std::fs::metadata(parent) {
            Ok(meta) if !meta.is_dir() => Err(DatabaseError::open_failed(
                OpenFailure::InvalidPath,
                format!("'{}' is not a directory", parent.display()),
            )),
            Ok(meta) if meta.permissions().readonly() => Err(DatabaseError::open_failed(
                OpenFailure::NoWritePermission,
                format!("no write permission in directory '{}'", parent.display()),
            )),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DatabaseError::open_failed(
                OpenFailure::ParentDirectoryMissing,
                format!("parent directory does not exist: {}", parent.display()),
            )),
            Err(e) => Err(io_open_error(&parent.display().to_string(), e)),
        }
    }

    /// Open SQLite connection
    fn open_connection(
        target: &SqliteTarget,
        options: &SqliteOptions,
    ) -> Result<RusqliteConnection, DatabaseError> {
        let conn = match target.mode {
            SqliteMode::Memory => RusqliteConnection::open_in_memory(),
            mode => {
                let flags = match mode {
                    SqliteMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
                    SqliteMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
                    _ => OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
                };
                RusqliteConnection::open_with_flags(&target.path, flags)
            }
        }
        .map_err(|e| sqlite_open_error(target, e))?;

        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .map_err(|e| sqlite_open_error(target, e))?;

        // Touch the schema so a file that is not a database fails here
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
            .map_err(|e| sqlite_open_error(target, e))?;

        Ok(conn)
    }

    /// Run every statement in `sql` in order and return the last result.
    /// Positional parameters are consumed left to right across statements.
    fn run_batch(
        conn: &RusqliteConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError> {
        let supplied = params.len();
        let mut remaining = params;
        let mut last = None;

        let mut batch = Batch::new(conn, sql);
        while let Some(mut stmt) = batch.next()? {
            let wanted = stmt.parameter_count();
            if wanted > remaining.len() {
                return Err(DatabaseError::rejected(format!(
                    "statement expects {} parameter(s) but only {} of {} supplied remain",
                    wanted,
                    remaining.len(),
                    supplied
                )));
            }
            let (own, rest) = remaining.split_at(wanted);
            remaining = rest;
            last = Some(Self::run_statement(conn, &mut stmt, own)?);
        }

        if !remaining.is_empty() {
            return Err(DatabaseError::rejected(format!(
                "{} parameter(s) supplied but the query used only {}",
                supplied,
                supplied - remaining.len()
            )));
        }

        last.ok_or_else(|| DatabaseError::rejected("query text contains no SQL statement"))
    }

    /// Bind and run one prepared statement
    fn run_statement(
        conn: &RusqliteConnection,
        stmt: &mut Statement<'_>,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError> {
        for (idx, param) in params.iter().enumerate() {
            stmt.raw_bind_parameter(idx + 1, Self::to_sql_value(param))?;
        }

        let column_count = stmt.column_count();
        if column_count == 0 {
            let rows_affected = stmt.raw_execute()?;
            return Ok(NativeResult::Affected {
                rows_affected: rows_affected as u64,
                last_insert_rowid: conn.last_insert_rowid(),
            });
        }

        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let declared: Vec<DeclaredType> = stmt
            .columns()
            .iter()
            .map(|column| DeclaredType::from_decl(column.decl_type()))
            .collect();

        let mut row_vec = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            let cells = declared
                .iter()
                .enumerate()
                .map(|(idx, kind)| Self::cell_value_from_row(row, idx, *kind))
                .collect::<Result<Vec<_>, _>>()?;
            row_vec.push(cells);
        }

        Ok(NativeResult::Rows {
            columns,
            rows: row_vec,
        })
    }

    /// Convert a positional JSON parameter to a SQLite value
    fn to_sql_value(param: &QueryParam) -> SqlValue {
        match param {
            QueryParam::Null => SqlValue::Null,
            QueryParam::Bool(b) => SqlValue::Integer(i64::from(*b)),
            QueryParam::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            QueryParam::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// Extract cell value from row. The storage class decides, except that
    /// BOOLEAN columns yield bools and numeric date/time values yield text.
    fn cell_value_from_row(
        row: &rusqlite::Row,
        idx: usize,
        declared: DeclaredType,
    ) -> Result<CellValue, rusqlite::Error> {
        Ok(match (declared, row.get_ref(idx)?) {
            (_, ValueRef::Null) => CellValue::Null,
            (DeclaredType::Boolean, ValueRef::Integer(v)) => CellValue::Bool(v != 0),
            (DeclaredType::Plain | DeclaredType::Boolean, ValueRef::Integer(v)) => CellValue::Int(v),
            (DeclaredType::Plain | DeclaredType::Boolean, ValueRef::Real(v)) => CellValue::Float(v),
            (temporal, ValueRef::Integer(secs)) => temporal_text(temporal, secs as f64)
                .map(CellValue::String)
                .unwrap_or(CellValue::Int(secs)),
            (temporal, ValueRef::Real(julian_day)) => {
                temporal_text(temporal, (julian_day - UNIX_EPOCH_JULIAN_DAY) * 86_400.0)
                    .map(CellValue::String)
                    .unwrap_or(CellValue::Float(julian_day))
            }
            (_, ValueRef::Text(bytes)) => CellValue::String(String::from_utf8_lossy(bytes).into_owned()),
            (_, ValueRef::Blob(bytes)) => CellValue::Binary(bytes.to_vec()),
        })
    }
}

/// Julian day number of 1970-01-01T00:00:00Z
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// Column type as declared in the schema, for the types SQLite has no
/// storage class of its own for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeclaredType {
    Plain,
    Boolean,
    Date,
    Time,
    DateTime,
}

impl DeclaredType {
    fn from_decl(decl: Option<&str>) -> Self {
        match decl.map(|d| d.trim().to_ascii_uppercase()).as_deref() {
            Some("BOOLEAN") | Some("BOOL") => DeclaredType::Boolean,
            Some("DATE") => DeclaredType::Date,
            Some("TIME") => DeclaredType::Time,
            Some("DATETIME") | Some("TIMESTAMP") => DeclaredType::DateTime,
            _ => DeclaredType::Plain,
        }
    }
}

/// Render seconds since the Unix epoch (UTC) the way SQLite's date functions do
fn temporal_text(declared: DeclaredType, unix_secs: f64) -> Option<String> {
    if !unix_secs.is_finite() {
        return None;
    }
    let whole = unix_secs.floor();
    let nanos = ((unix_secs - whole) * 1e9) as u32;
    let at = DateTime::from_timestamp(whole as i64, nanos)?.naive_utc();

    Some(match declared {
        DeclaredType::Date => at.format("%Y-%m-%d").to_string(),
        DeclaredType::Time => at.format("%H:%M:%S").to_string(),
        _ => at.format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn io_open_error(path: &str, err: std::io::Error) -> DatabaseError {
    let cause = if err.kind() == std::io::ErrorKind::PermissionDenied {
        OpenFailure::NoWritePermission
    } else {
        OpenFailure::InvalidPath
    };
    DatabaseError::open_failed(cause, format!("cannot access '{}': {}", path, err))
}

fn sqlite_open_error(target: &SqliteTarget, err: rusqlite::Error) -> DatabaseError {
    let message = format!("Failed to open SQLite database '{}': {}", target.path, err);
    let cause = match err.sqlite_error_code() {
        Some(ErrorCode::CannotOpen) if target.mode.is_writable() => OpenFailure::NoWritePermission,
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::NotADatabase) => OpenFailure::InvalidPath,
        Some(ErrorCode::ReadOnly) | Some(ErrorCode::PermissionDenied) => {
            OpenFailure::NoWritePermission
        }
        _ => OpenFailure::Other,
    };
    DatabaseError::open_failed(cause, message)
}

#[async_trait::async_trait]
impl DatabaseDriver for SqliteDriver {
    fn family(&self) -> DatabaseFamily {
        DatabaseFamily::RelationalFile
    }

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn Connection>, DatabaseError> {
        let target = match descriptor {
            ConnectionDescriptor::Sqlite(target) => target.clone(),
            _ => return Err(DatabaseError::internal("SQLite driver got a non-SQLite descriptor")),
        };
        let options = self.options.clone();

        let conn = tokio::task::spawn_blocking(move || {
            Self::validate_path(&target, options.create_if_missing)?;
            Self::open_connection(&target, &options)
        })
        .await
        .map_err(|e| DatabaseError::internal(format!("SQLite open task failed: {}", e)))??;

        let connection = SqliteConnection::new(uuid::Uuid::new_v4().to_string(), conn);
        debug!(connection_id = %connection.id, "Opened SQLite connection");
        Ok(Box::new(connection))
    }

    async fn execute(
        &self,
        conn: &dyn Connection,
        text: &str,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError> {
        let sqlite_conn = downcast::<SqliteConnection>(conn)?;
        let ticket = sqlite_conn.tickets.fetch_add(1, Ordering::SeqCst);
        let guard = Arc::clone(&sqlite_conn.conn).lock_owned().await;

        let abandoned = Arc::new(AtomicBool::new(false));
        let mut interrupt_guard = InterruptOnDrop {
            conn: sqlite_conn,
            ticket,
            abandoned: Arc::clone(&abandoned),
            armed: true,
        };

        let running = Arc::clone(&sqlite_conn.running);
        let sql = text.to_string();
        let params = params.to_vec();

        let result = tokio::task::spawn_blocking(move || {
            let conn = guard
                .as_ref()
                .ok_or_else(|| DatabaseError::rejected("connection is closed"))?;

            {
                let mut running = running.lock().unwrap_or_else(|p| p.into_inner());
                if abandoned.load(Ordering::SeqCst) {
                    return Err(DatabaseError::rejected("query was abandoned"));
                }
                *running = Some(ticket);
            }

            let result = Self::run_batch(conn, &sql, &params);

            *running.lock().unwrap_or_else(|p| p.into_inner()) = None;
            drop(guard);
            result
        })
        .await;

        interrupt_guard.armed = false;
        result.map_err(|e| DatabaseError::internal(format!("SQLite worker failed: {}", e)))?
    }

    async fn close(&self, conn: &dyn Connection) -> Result<(), DatabaseError> {
        let sqlite_conn = downcast::<SqliteConnection>(conn)?;
        let taken = sqlite_conn.conn.lock().await.take();

        match taken {
            Some(inner) => inner.close().map_err(|(_, e)| {
                warn!(connection_id = %sqlite_conn.id, "SQLite close failed: {}", e);
                DatabaseError::from(e)
            }),
            None => Ok(()),
        }
    }
}
