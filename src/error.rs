//! Error types for the driver.
//!
//! Everything that performs network I/O or could corrupt protocol framing
//! reports a [`PgError`]. Introspection calls return sentinels instead.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for driver operations.
pub type PgResult<T> = std::result::Result<T, PgError>;

#[derive(Error, Debug)]
pub enum PgError {
    /// Transport, handshake or authentication failure while connecting.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The backend answered a request with an ErrorResponse.
    #[error("{0}")]
    QueryError(DbError),

    #[error("Prepared statement \"{0}\" already exists")]
    StatementExistsError(String),

    #[error("Prepared statement \"{0}\" does not exist")]
    UnknownStatementError(String),

    #[error("Prepared statement \"{name}\" expects {expected} parameters, {given} given")]
    ParameterCountError {
        name: String,
        expected: usize,
        given: usize,
    },

    #[error("Row {row} not found, result has {rows} rows")]
    RowNotFoundError { row: usize, rows: usize },

    #[error("Invalid column: {0}")]
    InvalidColumnError(String),

    /// A request was issued while another one is still outstanding.
    #[error("Another command is already in progress")]
    BusyConnectionError,

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Unexpected or malformed message.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Type conversion error: {0}")]
    TypeError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PgError {
    /// The backend diagnostic, if this error came from an ErrorResponse.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            PgError::QueryError(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE of a backend error.
    pub fn code(&self) -> Option<&str> {
        self.db_error().map(DbError::code)
    }
}

// ============================================================================
// Backend diagnostics
// ============================================================================

/// Field codes of an ErrorResponse / NoticeResponse.
///
/// Reference: https://www.postgresql.org/docs/current/protocol-error-fields.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorField {
    Severity = b'S',
    SeverityNonLocalized = b'V',
    SqlState = b'C',
    MessagePrimary = b'M',
    MessageDetail = b'D',
    MessageHint = b'H',
    StatementPosition = b'P',
    InternalPosition = b'p',
    InternalQuery = b'q',
    Context = b'W',
    SchemaName = b's',
    TableName = b't',
    ColumnName = b'c',
    DataTypeName = b'd',
    ConstraintName = b'n',
    SourceFile = b'F',
    SourceLine = b'L',
    SourceFunction = b'R',
}

/// An error or notice reported by the backend, with every field preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    fields: HashMap<u8, String>,
}

impl DbError {
    pub fn from_fields(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    pub fn field(&self, field: ErrorField) -> Option<&str> {
        self.fields.get(&(field as u8)).map(String::as_str)
    }

    pub fn severity(&self) -> &str {
        self.field(ErrorField::Severity).unwrap_or_default()
    }

    /// The five character SQLSTATE.
    pub fn code(&self) -> &str {
        self.field(ErrorField::SqlState).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field(ErrorField::MessagePrimary).unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(ErrorField::MessageDetail)
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(ErrorField::MessageHint)
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity(), self.message(), self.code())?;
        if let Some(d) = self.detail() {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = self.hint() {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}
