// Error Taxonomy
// Stable error kinds surfaced to the presentation layer, plus the classifier
// that maps native driver messages onto them

use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// Why a connection string could not be turned into a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DescriptorIssue {
    Unparseable,
    MissingDatabaseName,
    EmptyPath,
    InvalidOption,
}

/// Why an adapter failed to open a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenFailure {
    // relational-file
    ParentDirectoryMissing,
    NoWritePermission,
    InvalidPath,
    // document-network
    ConnectionRefused,
    AuthenticationFailed,
    InvalidNamespace,
    MissingDatabaseName,
    /// Unrecognized native cause, message kept verbatim
    Other,
}

/// Whether the user should fix the connection or the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Connection,
    Query,
}

/// Error type returned by every public operation of the core
#[derive(Debug, Clone, Error)]
pub enum DatabaseError {
    #[error("Invalid connection string: {message}")]
    InvalidDescriptor {
        issue: DescriptorIssue,
        message: String,
    },

    #[error("Unsupported connection scheme: {scheme}")]
    Unsupported { scheme: String },

    #[error("Failed to open connection: {message}")]
    OpenFailed {
        cause: OpenFailure,
        message: String,
        hint: Option<String>,
    },

    #[error("Query rejected by database: {message}")]
    DriverRejected { message: String, code: Option<i32> },

    #[error("Query timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DatabaseError {
    pub fn invalid_descriptor(issue: DescriptorIssue, message: impl Into<String>) -> Self {
        DatabaseError::InvalidDescriptor {
            issue,
            message: message.into(),
        }
    }

    pub fn open_failed(cause: OpenFailure, message: impl Into<String>) -> Self {
        DatabaseError::OpenFailed {
            cause,
            message: message.into(),
            hint: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        DatabaseError::DriverRejected {
            message: message.into(),
            code: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DatabaseError::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            DatabaseError::InvalidDescriptor { .. } => "invalidDescriptor",
            DatabaseError::Unsupported { .. } => "unsupported",
            DatabaseError::OpenFailed { .. } => "openFailed",
            DatabaseError::DriverRejected { .. } => "driverRejected",
            DatabaseError::Timeout { .. } => "timeout",
            DatabaseError::Internal { .. } => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            DatabaseError::DriverRejected { .. } | DatabaseError::Timeout { .. } => {
                ErrorCategory::Query
            }
            _ => ErrorCategory::Connection,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        self.category() == ErrorCategory::Connection
    }

    pub fn open_cause(&self) -> Option<OpenFailure> {
        match self {
            DatabaseError::OpenFailed { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    pub fn descriptor_issue(&self) -> Option<DescriptorIssue> {
        match self {
            DatabaseError::InvalidDescriptor { issue, .. } => Some(*issue),
            _ => None,
        }
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            DatabaseError::OpenFailed { hint, .. } => hint.as_deref(),
            DatabaseError::InvalidDescriptor {
                issue: DescriptorIssue::MissingDatabaseName,
                ..
            } => Some(MISSING_DATABASE_HINT),
            _ => None,
        }
    }

    /// Map a native cause onto the taxonomy and attach a user hint.
    ///
    /// Unrecognized causes keep `OpenFailure::Other` and their original
    /// message; nothing is ever discarded.
    pub fn classify(self) -> Self {
        match self {
            DatabaseError::OpenFailed {
                cause,
                message,
                hint: None,
            } => {
                let (cause, hint) = if cause == OpenFailure::Other {
                    classify_open_message(&message)
                } else {
                    (cause, default_hint(cause))
                };
                DatabaseError::OpenFailed {
                    cause,
                    message,
                    hint: hint.map(str::to_string),
                }
            }
            other => other,
        }
    }
}

const MISSING_DATABASE_HINT: &str =
    "Add a database name after the host, e.g. mongodb://localhost:27017/mydb.";

const AUTH_HINT: &str = "Check the username and password. If the user is defined in another \
     database, add ?authSource=admin to the connection string.";

const AUTHORIZATION_HINT: &str = "The user may not have access to this database.";

fn default_hint(cause: OpenFailure) -> Option<&'static str> {
    match cause {
        OpenFailure::ParentDirectoryMissing => {
            Some("Create the parent directory or choose another location.")
        }
        OpenFailure::NoWritePermission => Some(
            "Choose a location you can write to, or open the file read-only with ?mode=ro.",
        ),
        OpenFailure::InvalidPath => Some("Check the database file path."),
        OpenFailure::ConnectionRefused => Some(
            "Check that the MongoDB server is running and reachable from this machine.",
        ),
        OpenFailure::AuthenticationFailed => Some(AUTH_HINT),
        OpenFailure::InvalidNamespace => Some(
            "Database names cannot contain spaces or any of / \\ . \" $ * < > : | ?",
        ),
        OpenFailure::MissingDatabaseName => Some(MISSING_DATABASE_HINT),
        OpenFailure::Other => None,
    }
}

/// Recognize well-known native open failures by their message text
fn classify_open_message(message: &str) -> (OpenFailure, Option<&'static str>) {
    let lower = message.to_lowercase();

    let cause = if lower.contains("scram failure")
        || lower.contains("authentication failed")
        || lower.contains("auth error")
    {
        OpenFailure::AuthenticationFailed
    } else if lower.contains("not authorized") || lower.contains("authorization") {
        return (OpenFailure::AuthenticationFailed, Some(AUTHORIZATION_HINT));
    } else if lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("server selection timeout")
        || lower.contains("failed to lookup address")
        || lower.contains("dns")
    {
        OpenFailure::ConnectionRefused
    } else if lower.contains("invalid database name") || lower.contains("invalid namespace") {
        OpenFailure::InvalidNamespace
    } else if lower.contains("unable to open database file") {
        OpenFailure::InvalidPath
    } else {
        OpenFailure::Other
    };

    (cause, default_hint(cause))
}

impl Serialize for DatabaseError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DatabaseError", 6)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("category", &self.category())?;
        match self {
            DatabaseError::InvalidDescriptor { issue, .. } => {
                state.serialize_field("cause", issue)?;
            }
            DatabaseError::OpenFailed { cause, .. } => {
                state.serialize_field("cause", cause)?;
            }
            _ => state.skip_field("cause")?,
        }
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("hint", &self.hint())?;
        match self {
            DatabaseError::DriverRejected { code: Some(code), .. } => {
                state.serialize_field("code", code)?;
            }
            _ => state.skip_field("code")?,
        }
        state.end()
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
            _ => None,
        };
        DatabaseError::DriverRejected {
            message: err.to_string(),
            code,
        }
    }
}

/// Transport and authentication failures are connection errors even when
/// they surface during a query; everything else is the server rejecting it.
impl From<mongodb::error::Error> for DatabaseError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        let cause = match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. } => Some(OpenFailure::ConnectionRefused),
            ErrorKind::Authentication { .. } => Some(OpenFailure::AuthenticationFailed),
            _ => None,
        };
        if let Some(cause) = cause {
            return DatabaseError::open_failed(cause, format!("Lost connection to MongoDB: {}", err));
        }

        let code = match err.kind.as_ref() {
            ErrorKind::Command(command) => Some(command.code),
            _ => None,
        };
        DatabaseError::DriverRejected {
            message: err.to_string(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_auth_failure() {
        let err = DatabaseError::open_failed(
            OpenFailure::Other,
            "Command failed: SCRAM failure: Authentication failed.",
        )
        .classify();

        assert_eq!(err.open_cause(), Some(OpenFailure::AuthenticationFailed));
        assert!(err.hint().unwrap().contains("authSource=admin"));
        assert!(err.to_string().contains("SCRAM failure"));
    }

    #[test]
    fn test_classify_refused() {
        let err = DatabaseError::open_failed(
            OpenFailure::Other,
            "Server selection timeout: No available servers. Topology: { Type: Unknown, \
             Servers: [ { Address: localhost:27017, Type: Unknown, Error: Connection refused } ] }",
        )
        .classify();
        assert_eq!(err.open_cause(), Some(OpenFailure::ConnectionRefused));
    }

    #[test]
    fn test_classify_authorization() {
        let err = DatabaseError::open_failed(
            OpenFailure::Other,
            "Command failed (Unauthorized): not authorized on admin to execute command",
        )
        .classify();
        assert_eq!(err.open_cause(), Some(OpenFailure::AuthenticationFailed));
        assert_eq!(err.hint(), Some(AUTHORIZATION_HINT));
    }

    #[test]
    fn test_unknown_cause_kept_verbatim() {
        let err = DatabaseError::open_failed(OpenFailure::Other, "something odd happened").classify();
        assert_eq!(err.open_cause(), Some(OpenFailure::Other));
        assert!(err.hint().is_none());
        assert_eq!(
            err.to_string(),
            "Failed to open connection: something odd happened"
        );
    }

    #[test]
    fn test_known_cause_gets_hint() {
        let err = DatabaseError::open_failed(OpenFailure::ParentDirectoryMissing, "no dir").classify();
        assert_eq!(err.open_cause(), Some(OpenFailure::ParentDirectoryMissing));
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            DatabaseError::rejected("no such table: t").category(),
            ErrorCategory::Query
        );
        assert_eq!(
            DatabaseError::Timeout { elapsed_ms: 10 }.category(),
            ErrorCategory::Query
        );
        assert!(DatabaseError::Unsupported {
            scheme: "redis".to_string()
        }
        .is_connection_error());
    }

    #[test]
    fn test_serialize_shape() {
        let err = DatabaseError::invalid_descriptor(
            DescriptorIssue::MissingDatabaseName,
            "no database name in mongodb://localhost",
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalidDescriptor");
        assert_eq!(json["category"], "connection");
        assert_eq!(json["cause"], "missingDatabaseName");
        assert!(json["hint"].as_str().is_some());

        let err = DatabaseError::DriverRejected {
            message: "no such table: nonexistent_table".to_string(),
            code: Some(1),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "driverRejected");
        assert_eq!(json["category"], "query");
        assert_eq!(json["code"], 1);
        assert!(json.get("cause").is_none());
    }
}
