//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an ErrorResponse.
    #[error("{0}")]
    Server(ServerError),

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// Invalid DSN or configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS negotiation or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A read or write deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The server answered a query with EmptyQueryResponse.
    #[error("query is empty")]
    EmptyQuery,

    /// The connection is unusable and must be discarded.
    #[error("bad connection")]
    BadConnection,

    /// The COPY source or destination failed. The connection stays usable.
    #[error("COPY stream error: {0}")]
    Copy(#[source] io::Error),

    /// The listener was closed.
    #[error("listener is closed")]
    ListenerClosed,
}

impl PgError {
    /// Whether the connection that produced this error must be discarded.
    ///
    /// Server errors only poison the connection when their severity is
    /// `FATAL` or `PANIC`; the server closes the session after sending them.
    pub fn is_bad_conn(&self) -> bool {
        match self {
            PgError::Server(e) => e.is_fatal(),
            PgError::Io(_)
            | PgError::Protocol(_)
            | PgError::Auth(_)
            | PgError::Tls(_)
            | PgError::Timeout
            | PgError::BadConnection => true,
            PgError::Type(_)
            | PgError::Config(_)
            | PgError::EmptyQuery
            | PgError::Copy(_)
            | PgError::ListenerClosed => false,
        }
    }

    /// Whether this is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            PgError::Timeout => true,
            PgError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// The server error, if this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) => Some(e),
            _ => None,
        }
    }
}

/// An ErrorResponse sent by the server, keyed by the protocol's field codes.
///
/// See <https://www.postgresql.org/docs/current/protocol-error-fields.html>.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    fields: HashMap<u8, String>,
}

impl ServerError {
    pub(crate) fn new(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    /// Raw access to a field by its one-byte code (`b'S'`, `b'C'`, ...).
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    /// Severity (`ERROR`, `FATAL`, `PANIC`, ...).
    ///
    /// Prefers the non-localized `V` field when the server sends it.
    pub fn severity(&self) -> &str {
        self.field(b'V').or_else(|| self.field(b'S')).unwrap_or("")
    }

    /// SQLSTATE code.
    pub fn code(&self) -> &str {
        self.field(b'C').unwrap_or("")
    }

    pub fn message(&self) -> &str {
        self.field(b'M').unwrap_or("")
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(b'H')
    }

    /// Whether the server is terminating the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (SQLSTATE={})", self.severity(), self.message(), self.code())?;
        if let Some(d) = self.detail() {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = self.hint() {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(e)
    }
}
