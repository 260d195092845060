//! Error taxonomy.
//!
//! Internal failures are split by retryability at the type level so the retry
//! loop can only retry what is worth retrying. Callers only ever see
//! `GatewayError`.

use thiserror::Error;

/// Failure while establishing the tunnel or opening a database connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// Credentials or key rejected. Retrying cannot help.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Host unreachable, refused, timed out, or the session died early.
    #[error("network failure: {0}")]
    Network(String),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Network(_))
    }
}

/// Failure while running a statement on an open connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryFailure {
    /// The transport under a previously healthy connection failed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The database rejected the statement itself.
    #[error("{0}")]
    Rejected(String),
}

/// Errors surfaced by `QueryGateway::execute`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("authentication to the database host failed: {message}")]
    Authentication { message: String },

    #[error("database unavailable after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    #[error("query rejected by database: {message}")]
    Query { message: String },

    #[error("query gateway has been shut down")]
    Closed,
}

impl GatewayError {
    /// True for failures that mean "service unavailable" rather than a bad query.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, GatewayError::Query { .. })
    }
}
