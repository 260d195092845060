//! One supervised database connection per process.
//!
//! The connection remembers which tunnel it was opened through. It is only
//! handed out while that exact tunnel is still the live one; otherwise it is
//! discarded and a new one is opened.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::driver::{DatabaseConnection, DatabaseDriver};
use super::types::{Row, Value};
use crate::error::{ConnectError, QueryFailure};
use crate::services::ssh::{ExponentialBackoff, ReconnectConfig, TunnelId, TunnelManager, TunnelState};
use crate::services::timeout::with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Connected,
    Broken,
}

/// A database connection bound to the tunnel it was opened through.
pub struct ManagedConnection {
    conn: Box<dyn DatabaseConnection>,
    tunnel_id: TunnelId,
    local_port: u16,
    health: ConnectionHealth,
    opened_at: Instant,
    last_used: Instant,
}

impl ManagedConnection {
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryFailure> {
        self.last_used = Instant::now();
        self.conn.query(sql, params).await
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tunnel_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorState {
    pub tunnel: TunnelState,
    pub connection: Option<ConnectionHealth>,
    pub local_port: Option<u16>,
    pub idle_ms: Option<u128>,
    pub connects: u64,
}

pub struct ConnectionSupervisor {
    tunnels: TunnelManager,
    driver: Arc<dyn DatabaseDriver>,
    current: Option<ManagedConnection>,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    connects: u64,
}

impl ConnectionSupervisor {
    pub fn new(
        tunnels: TunnelManager,
        driver: Arc<dyn DatabaseDriver>,
        reconnect: ReconnectConfig,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            tunnels,
            driver,
            current: None,
            reconnect,
            connect_timeout,
            connects: 0,
        }
    }

    /// Get a usable connection with a fresh retry budget.
    pub async fn get_connection(&mut self) -> Result<&mut ManagedConnection, ConnectError> {
        let mut backoff = ExponentialBackoff::new(self.reconnect.clone());
        self.get_connection_with(&mut backoff).await
    }

    /// Get a usable connection, spending attempts from `backoff`.
    ///
    /// Reuses the current connection when it is healthy and its tunnel is
    /// still the live one. Otherwise reconnects, re-establishing the tunnel
    /// if it died. Authentication failures return at once.
    pub async fn get_connection_with(
        &mut self,
        backoff: &mut ExponentialBackoff,
    ) -> Result<&mut ManagedConnection, ConnectError> {
        if self.reusable() {
            return self
                .current
                .as_mut()
                .ok_or_else(|| ConnectError::Network("connection vanished".to_string()));
        }

        self.discard().await;

        loop {
            let attempt = backoff.attempt();
            if attempt > 1 || self.connects > 0 {
                tracing::warn!(
                    "Reconnecting to database (attempt {}/{})...",
                    attempt,
                    backoff.max_attempts()
                );
            }

            let err = match self.open().await {
                Ok(conn) => {
                    if attempt > 1 || self.connects > 1 {
                        tracing::info!(
                            local_port = conn.local_port,
                            "Reconnected to database on attempt {}",
                            attempt
                        );
                    }
                    return Ok(self.current.insert(conn));
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::error!("Connection attempt {} failed, not retrying: {}", attempt, err);
                return Err(err);
            }

            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "Connection attempt {} failed: {}; retrying in {:?}",
                        attempt,
                        err,
                        delay
                    );
                    smol::Timer::after(delay).await;
                }
                None => {
                    tracing::error!(
                        "Connection attempt {} failed, giving up after {} attempts: {}",
                        attempt,
                        backoff.failures(),
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Flag the current connection as unusable. The next `get_connection` rebuilds it.
    pub fn mark_broken(&mut self) {
        if let Some(conn) = self.current.as_mut() {
            if conn.health == ConnectionHealth::Connected {
                tracing::warn!(
                    "Database connection via local port {} marked broken",
                    conn.local_port
                );
            }
            conn.health = ConnectionHealth::Broken;
        }
    }

    /// Ping the current connection; a failed ping marks it broken.
    pub async fn health_check(&mut self) -> bool {
        let timeout = self.connect_timeout;
        let Some(conn) = self.current.as_mut() else {
            return false;
        };
        if conn.health == ConnectionHealth::Broken {
            return false;
        }
        let healthy = matches!(with_timeout(timeout, conn.conn.ping()).await, Some(Ok(())));
        if !healthy {
            self.mark_broken();
        }
        healthy
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState {
            tunnel: self.tunnels.state(),
            connection: self.current.as_ref().map(|c| c.health),
            local_port: self.current.as_ref().map(|c| c.local_port),
            idle_ms: self
                .current
                .as_ref()
                .map(|c| c.last_used.elapsed().as_millis()),
            connects: self.connects,
        }
    }

    /// Close the connection, then the tunnel.
    pub async fn shutdown(&mut self) {
        self.discard().await;
        self.tunnels.close().await;
    }

    fn reusable(&mut self) -> bool {
        let tunnel_id = match self.current.as_ref() {
            Some(conn) if conn.health == ConnectionHealth::Connected => conn.tunnel_id,
            _ => return false,
        };
        self.tunnels.is_alive(tunnel_id)
    }

    async fn discard(&mut self) {
        if let Some(stale) = self.current.take() {
            // A broken socket can hang on the quit handshake
            if with_timeout(self.connect_timeout, stale.conn.close())
                .await
                .is_none()
            {
                tracing::debug!("Timed out closing stale database connection");
            }
        }
    }

    async fn open(&mut self) -> Result<ManagedConnection, ConnectError> {
        let (tunnel_id, addr) = {
            let handle = self.tunnels.ensure_tunnel().await?;
            (handle.id(), handle.local_addr())
        };

        let conn = match with_timeout(self.connect_timeout, self.driver.connect(addr)).await {
            Some(result) => result?,
            None => {
                return Err(ConnectError::Network(format!(
                    "Database connect timed out after {:?}",
                    self.connect_timeout
                )));
            }
        };

        self.connects += 1;
        tracing::info!(local_port = addr.port(), "Connected via SSH tunnel");

        let now = Instant::now();
        Ok(ManagedConnection {
            conn,
            tunnel_id,
            local_port: addr.port(),
            health: ConnectionHealth::Connected,
            opened_at: now,
            last_used: now,
        })
    }
}
