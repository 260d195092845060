//! Tunnel lifecycle: at most one live tunnel per manager.
//!
//! `Absent -> Establishing -> Live -> Absent`. A handle is never repaired in
//! place; a dead one is closed and a new one takes its place with a new id.

use crate::error::ConnectError;
use crate::services::timeout::with_timeout;
use async_trait::async_trait;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for one tunnel generation
pub type TunnelId = Uuid;

/// Produces a transport session with a bound local forwarding address.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, ConnectError>;
}

/// A live transport session.
#[async_trait]
pub trait TunnelSession: Send {
    fn local_addr(&self) -> SocketAddr;
    /// Cheap liveness probe; must not block.
    fn is_alive(&mut self) -> bool;
    async fn shutdown(self: Box<Self>);
}

/// Tunnel lifecycle states
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Absent,
    Establishing,
    Live { local_addr: SocketAddr },
}

impl TunnelState {
    pub fn is_live(&self) -> bool {
        matches!(self, TunnelState::Live { .. })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            TunnelState::Live { local_addr } => Some(*local_addr),
            _ => None,
        }
    }
}

/// One established tunnel.
pub struct TunnelHandle {
    id: TunnelId,
    local_addr: SocketAddr,
    session: Box<dyn TunnelSession>,
    created_at: Instant,
    alive: bool,
}

impl TunnelHandle {
    fn new(session: Box<dyn TunnelSession>) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr: session.local_addr(),
            session,
            created_at: Instant::now(),
            alive: true,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_live(&self) -> bool {
        self.alive
    }

    /// Probe the session. Once dead, a handle stays dead.
    fn probe(&mut self) -> bool {
        if self.alive && !self.session.is_alive() {
            self.alive = false;
        }
        self.alive
    }
}

/// Owns the process's tunnel.
pub struct TunnelManager {
    connector: Arc<dyn TunnelConnector>,
    establish_timeout: Duration,
    current: Option<TunnelHandle>,
    state: TunnelState,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn TunnelConnector>, establish_timeout: Duration) -> Self {
        Self {
            connector,
            establish_timeout,
            current: None,
            state: TunnelState::Absent,
        }
    }

    /// Return the live handle, establishing a new tunnel if needed.
    pub async fn ensure_tunnel(&mut self) -> Result<&TunnelHandle, ConnectError> {
        let live = self.current.as_mut().is_some_and(TunnelHandle::probe);
        if live {
            return self
                .current
                .as_ref()
                .ok_or_else(|| ConnectError::Network("tunnel handle vanished".to_string()));
        }

        if let Some(stale) = self.current.take() {
            tracing::warn!(
                "Tunnel on local port {} is no longer alive after {:?}, replacing it",
                stale.local_port(),
                stale.created_at.elapsed()
            );
            stale.session.shutdown().await;
        }

        self.state = TunnelState::Establishing;
        let opened = with_timeout(self.establish_timeout, self.connector.open()).await;
        let session = match opened {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                self.state = TunnelState::Absent;
                return Err(e);
            }
            None => {
                self.state = TunnelState::Absent;
                return Err(ConnectError::Network(format!(
                    "Tunnel establishment timed out after {:?}",
                    self.establish_timeout
                )));
            }
        };

        let handle = TunnelHandle::new(session);
        tracing::info!(
            tunnel_id = %handle.id,
            local_port = handle.local_port(),
            "tunnel found on local port {}",
            handle.local_port()
        );
        self.state = TunnelState::Live {
            local_addr: handle.local_addr,
        };
        Ok(&*self.current.insert(handle))
    }

    /// True if `id` is the current tunnel and it still passes the probe.
    pub fn is_alive(&mut self, id: TunnelId) -> bool {
        match self.current.as_mut() {
            Some(handle) if handle.id == id => {
                let alive = handle.probe();
                if !alive {
                    self.state = TunnelState::Absent;
                }
                alive
            }
            _ => false,
        }
    }

    pub fn current(&self) -> Option<&TunnelHandle> {
        self.current.as_ref()
    }

    pub fn state(&self) -> TunnelState {
        self.state.clone()
    }

    /// Tear down the current tunnel, if any. Idempotent.
    pub async fn close(&mut self) {
        if let Some(handle) = self.current.take() {
            let port = handle.local_port();
            handle.session.shutdown().await;
            tracing::info!("Tunnel on local port {} closed", port);
        }
        self.state = TunnelState::Absent;
    }
}
