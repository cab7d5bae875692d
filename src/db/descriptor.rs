// Connection Descriptors
// Parses connection strings into typed descriptors and derives the canonical
// key used to deduplicate sessions

use crate::db::error::{DatabaseError, DescriptorIssue};
use crate::db::traits::DatabaseFamily;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

const SQLITE_MEMORY: &str = ":memory:";
const MONGODB_DEFAULT_PORT: u16 = 27017;
const MONGODB_SCHEME: &str = "mongodb";
const MONGODB_SRV_SCHEME: &str = "mongodb+srv";

/// How a SQLite file is opened, from the `?mode=` suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqliteMode {
    /// Read/write, create the file when missing
    #[default]
    ReadWriteCreate,
    /// Read/write, the file must exist
    ReadWrite,
    /// Read-only, the file must exist
    ReadOnly,
    /// Private in-memory database
    Memory,
}

impl SqliteMode {
    fn as_param(&self) -> &'static str {
        match self {
            SqliteMode::ReadWriteCreate => "rwc",
            SqliteMode::ReadWrite => "rw",
            SqliteMode::ReadOnly => "ro",
            SqliteMode::Memory => "memory",
        }
    }

    fn from_param(value: &str) -> Option<Self> {
        match value {
            "rwc" => Some(SqliteMode::ReadWriteCreate),
            "rw" => Some(SqliteMode::ReadWrite),
            "ro" => Some(SqliteMode::ReadOnly),
            "memory" => Some(SqliteMode::Memory),
            _ => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, SqliteMode::ReadOnly)
    }
}

/// Relational-file target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteTarget {
    /// Lexically normalized file path, `:memory:` for in-memory databases
    pub path: String,
    pub mode: SqliteMode,
}

impl SqliteTarget {
    pub fn is_memory(&self) -> bool {
        self.mode == SqliteMode::Memory
    }
}

/// One entry of a MongoDB seed list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub host: String,
    pub port: Option<u16>,
}

/// Document-network target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoTarget {
    pub srv: bool,
    pub hosts: Vec<HostAddr>,
    /// Credentials exactly as written (percent-encoded form)
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// URI options in the order they were written
    pub options: Vec<(String, String)>,
}

impl MongoTarget {
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn auth_source(&self) -> Option<&str> {
        self.option("authSource")
    }

    pub fn replica_set(&self) -> Option<&str> {
        self.option("replicaSet")
    }

    fn scheme(&self) -> &'static str {
        if self.srv {
            MONGODB_SRV_SCHEME
        } else {
            MONGODB_SCHEME
        }
    }

    fn render(&self, password: Option<&str>, canonical: bool) -> String {
        let mut out = format!("{}://", self.scheme());

        if let Some(username) = &self.username {
            out.push_str(username);
            if let Some(password) = password {
                out.push(':');
                out.push_str(password);
            }
            out.push('@');
        }

        let hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|addr| {
                let host = if canonical {
                    addr.host.to_lowercase()
                } else {
                    addr.host.clone()
                };
                let port = match (addr.port, canonical && !self.srv) {
                    (Some(port), _) => Some(port),
                    (None, true) => Some(MONGODB_DEFAULT_PORT),
                    (None, false) => None,
                };
                match port {
                    Some(port) => format!("{}:{}", host, port),
                    None => host,
                }
            })
            .collect();
        out.push_str(&hosts.join(","));

        out.push('/');
        out.push_str(&self.database);

        let options: Vec<(String, &str)> = if canonical {
            let mut sorted: Vec<(String, &str)> = self
                .options
                .iter()
                .map(|(key, value)| (key.to_lowercase(), value.as_str()))
                .collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            sorted
        } else {
            self.options
                .iter()
                .map(|(key, value)| (key.clone(), value.as_str()))
                .collect()
        };

        if !options.is_empty() {
            let query: Vec<String> = options
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            out.push('?');
            out.push_str(&query.join("&"));
        }

        out
    }
}

/// Parsed form of a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Sqlite(SqliteTarget),
    Mongo(MongoTarget),
}

impl ConnectionDescriptor {
    /// Parse a raw connection string
    pub fn parse(raw: &str) -> Result<Self, DatabaseError> {
        let raw = raw.trim();
        let (scheme, rest) = raw.split_once(':').ok_or_else(|| {
            DatabaseError::invalid_descriptor(
                DescriptorIssue::Unparseable,
                format!("missing scheme in '{}'", raw),
            )
        })?;

        if scheme.is_empty() {
            return Err(DatabaseError::invalid_descriptor(
                DescriptorIssue::Unparseable,
                "connection string is empty or has no scheme",
            ));
        }

        let scheme = scheme.to_ascii_lowercase();
        match DatabaseFamily::from_scheme(&scheme) {
            Some(DatabaseFamily::RelationalFile) => parse_sqlite(rest).map(Self::Sqlite),
            Some(DatabaseFamily::DocumentNetwork) => {
                parse_mongo(scheme == MONGODB_SRV_SCHEME, rest).map(Self::Mongo)
            }
            None => Err(DatabaseError::Unsupported { scheme }),
        }
    }

    pub fn family(&self) -> DatabaseFamily {
        match self {
            ConnectionDescriptor::Sqlite(_) => DatabaseFamily::RelationalFile,
            ConnectionDescriptor::Mongo(_) => DatabaseFamily::DocumentNetwork,
        }
    }

    /// Canonical connection string representation
    pub fn to_connection_string(&self) -> String {
        match self {
            ConnectionDescriptor::Sqlite(target) => render_sqlite(target),
            ConnectionDescriptor::Mongo(target) => target.render(target.password.as_deref(), false),
        }
    }

    /// Connection string with the password masked, safe for logs and UI
    pub fn redacted(&self) -> String {
        match self {
            ConnectionDescriptor::Sqlite(target) => render_sqlite(target),
            ConnectionDescriptor::Mongo(target) => {
                target.render(target.password.as_ref().map(|_| "****"), false)
            }
        }
    }

    /// Deduplication key; equal for strings differing only in formatting
    pub fn key(&self) -> ConnectionKey {
        let (canonical, redacted) = match self {
            ConnectionDescriptor::Sqlite(target) => {
                let rendered = render_sqlite(target);
                (rendered.clone(), rendered)
            }
            ConnectionDescriptor::Mongo(target) => (
                target.render(target.password.as_deref(), true),
                target.render(target.password.as_ref().map(|_| "****"), true),
            ),
        };
        ConnectionKey {
            canonical,
            redacted,
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_connection_string())
    }
}

/// Canonical session key. Carries credentials, so `Debug` and `Display`
/// only ever show the redacted form.
#[derive(Clone)]
pub struct ConnectionKey {
    canonical: String,
    redacted: String,
}

impl ConnectionKey {
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn redacted(&self) -> &str {
        &self.redacted
    }
}

impl PartialEq for ConnectionKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ConnectionKey {}

impl Hash for ConnectionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionKey").field(&self.redacted).finish()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

// ============================================================================
// SQLite
// ============================================================================

fn parse_sqlite(rest: &str) -> Result<SqliteTarget, DatabaseError> {
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let mut mode = SqliteMode::default();
    for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("mode", value)) => {
                mode = SqliteMode::from_param(value).ok_or_else(|| {
                    DatabaseError::invalid_descriptor(
                        DescriptorIssue::InvalidOption,
                        format!("unknown SQLite mode '{}'", value),
                    )
                })?;
            }
            _ => {
                return Err(DatabaseError::invalid_descriptor(
                    DescriptorIssue::InvalidOption,
                    format!("unsupported SQLite option '{}'", pair),
                ))
            }
        }
    }

    if path == SQLITE_MEMORY || mode == SqliteMode::Memory {
        return Ok(SqliteTarget {
            path: SQLITE_MEMORY.to_string(),
            mode: SqliteMode::Memory,
        });
    }

    if path.trim().is_empty() {
        return Err(DatabaseError::invalid_descriptor(
            DescriptorIssue::EmptyPath,
            "SQLite database path is required",
        ));
    }

    Ok(SqliteTarget {
        path: normalize_path(&expand_home(path)),
        mode,
    })
}

fn render_sqlite(target: &SqliteTarget) -> String {
    match target.mode {
        SqliteMode::Memory => format!("sqlite:{}", SQLITE_MEMORY),
        SqliteMode::ReadWriteCreate => format!("sqlite:{}", target.path),
        mode => format!("sqlite:{}?mode={}", target.path, mode.as_param()),
    }
}

/// Expand `~/` to the home directory if present
fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(rest).to_string_lossy().to_string(),
            None => path.to_string(),
        },
        None => path.to_string(),
    }
}

/// Drop `.` components, duplicate separators and trailing slashes without
/// touching the filesystem
fn normalize_path(path: &str) -> String {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        return ".".to_string();
    }
    normalized.to_string_lossy().to_string()
}

// ============================================================================
// MongoDB
// ============================================================================

fn unparseable(message: impl Into<String>) -> DatabaseError {
    DatabaseError::invalid_descriptor(DescriptorIssue::Unparseable, message)
}

fn parse_mongo(srv: bool, rest: &str) -> Result<MongoTarget, DatabaseError> {
    let rest = rest
        .strip_prefix("//")
        .ok_or_else(|| unparseable("MongoDB connection strings must start with mongodb:// or mongodb+srv://"))?;

    let (main, query) = match rest.split_once('?') {
        Some((main, query)) => (main, Some(query)),
        None => (rest, None),
    };

    let (userinfo, location) = match main.rfind('@') {
        Some(at) => (Some(&main[..at]), &main[at + 1..]),
        None => (None, main),
    };

    let (username, password) = match userinfo {
        Some(info) => {
            let (user, pass) = match info.split_once(':') {
                Some((user, pass)) => (user, Some(pass.to_string())),
                None => (info, None),
            };
            if user.is_empty() {
                return Err(unparseable("username must not be empty"));
            }
            (Some(user.to_string()), pass)
        }
        None => (None, None),
    };

    let (authority, path) = location.split_once('/').ok_or_else(|| {
        DatabaseError::invalid_descriptor(
            DescriptorIssue::MissingDatabaseName,
            "no database name found in connection string",
        )
    })?;

    let database = path.trim_end_matches('/');
    if database.trim().is_empty() {
        return Err(DatabaseError::invalid_descriptor(
            DescriptorIssue::MissingDatabaseName,
            "empty database name in connection string",
        ));
    }

    let hosts = authority
        .split(',')
        .map(parse_host)
        .collect::<Result<Vec<_>, _>>()?;

    if srv && (hosts.len() != 1 || hosts[0].port.is_some()) {
        return Err(unparseable(
            "mongodb+srv:// takes exactly one host name and no port",
        ));
    }

    let mut options = Vec::new();
    for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                options.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(DatabaseError::invalid_descriptor(
                    DescriptorIssue::InvalidOption,
                    format!("malformed option '{}'", pair),
                ))
            }
        }
    }

    Ok(MongoTarget {
        srv,
        hosts,
        username,
        password,
        database: database.to_string(),
        options,
    })
}

fn parse_host(raw: &str) -> Result<HostAddr, DatabaseError> {
    // [::1]:27017
    let (host, port) = if raw.starts_with('[') {
        let end = raw
            .find(']')
            .ok_or_else(|| unparseable(format!("unterminated IPv6 address '{}'", raw)))?;
        let host = &raw[..=end];
        match &raw[end + 1..] {
            "" => (host, None),
            tail => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(unparseable(format!("invalid host '{}'", raw))),
            },
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (raw, None),
        }
    };

    if host.is_empty() {
        return Err(unparseable("host must not be empty"));
    }

    let port = port
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| unparseable(format!("invalid port '{}'", p)))
        })
        .transpose()?;

    Ok(HostAddr {
        host: host.to_string(),
        port,
    })
}
