//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::TransactionStatus;
use crate::types::Oid;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read needed more bytes than the message holds.
    #[error("buffer exhausted: needed {needed} bytes, {remaining} remaining")]
    BufferExhausted { needed: usize, remaining: usize },

    /// A write did not fit a fixed-capacity sink.
    #[error("buffer overflow: cannot write {requested} bytes, capacity {capacity}")]
    BufferOverflow { requested: usize, capacity: usize },

    /// A message arrived that is unknown or not valid at this point of the protocol.
    #[error("unexpected message '{tag}' while {context}")]
    UnexpectedMessage { tag: char, context: &'static str },

    /// Malformed protocol data (bad length, missing terminator, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication handshake failed. The original cause is kept as the source.
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        #[source]
        source: Option<Box<PgError>>,
    },

    /// The server returned an ErrorResponse.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// begin/commit/rollback called in the wrong transaction state.
    #[error("unexpected transaction state: {operation} is not allowed while {actual:?}")]
    UnexpectedTransactionState {
        operation: &'static str,
        actual: TransactionStatus,
    },

    /// No pooled connection became available in time.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    /// A connection (or the pool's initial connections) could not be set up.
    #[error("could not initialize connection: {message}")]
    CouldNotInitializeConnection {
        message: String,
        #[source]
        source: Option<Box<PgError>>,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Connection is closed or in invalid state.
    #[error("connection is closed")]
    ConnectionClosed,

    /// TCP connect did not finish within the connect timeout.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// TLS negotiation or configuration failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A column value could not be converted into the requested type.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Invalid connection or pool configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller used the API in a way the protocol does not allow.
    #[error("{0}")]
    Usage(String),
}

impl PgError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            PgError::Io(_)
            | PgError::BufferExhausted { .. }
            | PgError::BufferOverflow { .. }
            | PgError::UnexpectedMessage { .. }
            | PgError::Protocol(_)
            | PgError::Authentication { .. }
            | PgError::CouldNotInitializeConnection { .. }
            | PgError::ConnectionClosed
            | PgError::ConnectTimeout(_)
            | PgError::Tls(_) => true,
            PgError::Server(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// The server error, if this is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(err) => Some(err),
            _ => None,
        }
    }

    pub(crate) fn auth(message: impl Into<String>) -> Self {
        PgError::Authentication {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap any error raised during the handshake as an authentication failure.
    pub(crate) fn into_auth(self) -> Self {
        match self {
            err @ PgError::Authentication { .. } => err,
            other => PgError::Authentication {
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    pub(crate) fn unexpected(tag: u8, context: &'static str) -> Self {
        PgError::UnexpectedMessage {
            tag: tag as char,
            context,
        }
    }
}

/// An ErrorResponse from the backend with its full field map.
///
/// Field codes follow the protocol: `S` severity, `C` SQLSTATE code,
/// `M` message, `D` detail, `H` hint, `P` position, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    fields: HashMap<u8, String>,
}

impl ServerError {
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    pub fn severity(&self) -> &str {
        self.field(b'V')
            .or_else(|| self.field(b'S'))
            .unwrap_or_default()
    }

    pub fn code(&self) -> &str {
        self.field(b'C').unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field(b'M').unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(b'D')
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(b'H')
    }

    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(String::as_str)
    }

    pub fn fields(&self) -> &HashMap<u8, String> {
        &self.fields
    }

    /// FATAL and PANIC errors end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }
}

impl fmt::Display for ServerError {
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

impl std::error::Error for ServerError {}

/// A value could not be decoded into the requested Rust type.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot decode column \"{column}\" ({type_name}, oid {oid}) as {target}: {reason}")]
pub struct DecodeError {
    pub oid: Oid,
    pub type_name: &'static str,
    pub target: &'static str,
    pub column: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(severity: &str) -> ServerError {
        let mut fields = HashMap::new();
        fields.insert(b'S', severity.to_string());
        fields.insert(b'C', "42P01".to_string());
        fields.insert(b'M', "relation \"foo\" does not exist".to_string());
        ServerError::new(fields)
    }

    #[test]
    fn test_server_error_display() {
        let err = server_error("ERROR");
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"foo\" does not exist (42P01)"
        );
        assert!(!err.is_fatal());
        assert!(!PgError::Server(err).is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PgError::Server(server_error("FATAL")).is_fatal());
        assert!(PgError::Protocol("bad".into()).is_fatal());
        assert!(!PgError::PoolClosed.is_fatal());
        assert!(!PgError::UnexpectedTransactionState {
            operation: "BEGIN",
            actual: TransactionStatus::InTransaction,
        }
        .is_fatal());
    }

    #[test]
    fn test_into_auth_keeps_cause() {
        let err = PgError::ConnectionClosed.into_auth();
        match &err {
            PgError::Authentication { source, .. } => {
                assert!(matches!(source.as_deref(), Some(PgError::ConnectionClosed)));
            }
            other => panic!("expected authentication error, got {other:?}"),
        }
        assert!(std::error::Error::source(&err).is_some());
    }
}
