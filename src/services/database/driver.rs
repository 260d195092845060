use async_trait::async_trait;
use std::net::SocketAddr;

use super::types::{Row, Value};
use crate::error::{ConnectError, QueryFailure};

/// Opens database connections against a local forwarding address.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn DatabaseConnection>, ConnectError>;
}

/// One open database connection.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Run a statement with positional `?` parameters.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryFailure>;

    /// Round-trip to the server without running a statement.
    async fn ping(&mut self) -> Result<(), QueryFailure>;

    async fn close(self: Box<Self>);
}
