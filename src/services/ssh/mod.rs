//! Bastion tunneling for database connections.
//!
//! This module provides:
//! - `SshTunnel` - ControlMaster session plus a local forwarder, using the system ssh binary
//! - `LocalForwarder` - listener on an OS-assigned port relaying through a `Relay`
//! - `TunnelManager` - one live tunnel per process, replaced when it dies
//! - `ExponentialBackoff` - bounded retry budget

mod forward;
mod manager;
mod reconnect;
mod tunnel;
mod types;

pub use forward::{LocalForwarder, Relay, RelayStream};
pub use manager::{TunnelConnector, TunnelHandle, TunnelId, TunnelManager, TunnelSession, TunnelState};
pub use reconnect::{ExponentialBackoff, ReconnectConfig, classify_ssh_failure};
pub use tunnel::{SshConnector, SshTunnel};
pub use types::SshTunnelConfig;
