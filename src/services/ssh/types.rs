//! SSH tunnel configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a bastion tunnel using the system ssh binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTunnelConfig {
    /// Bastion hostname
    pub ssh_host: String,
    /// Bastion port (default: 22)
    pub ssh_port: u16,
    /// Bastion username
    pub ssh_user: String,
    /// Private key used for authentication. No agent, no default keys.
    pub private_key_path: PathBuf,
    /// Remote host to forward to (as seen from the bastion)
    pub remote_host: String,
    /// Remote port to forward to
    pub remote_port: u16,
    /// Local bind address (default: 127.0.0.1). The port is always chosen by the OS.
    pub local_bind_host: String,
    /// Upper bound on session establishment
    pub connect_timeout: Duration,
    /// ServerAliveInterval for the master session
    pub keepalive_interval: Duration,
    /// Additional `Key=Value` options, each passed as `-o Key=Value`
    pub extra_options: Vec<String>,
}

impl SshTunnelConfig {
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            private_key_path: private_key_path.into(),
            remote_host: remote_host.into(),
            remote_port,
            local_bind_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(15),
            extra_options: Vec::new(),
        }
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_url(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }

    /// `host:port` handed to `ssh -W`
    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Options shared by the master session and every client that attaches to it.
    pub(crate) fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if self.ssh_port != 22 {
            args.push("-p".to_string());
            args.push(self.ssh_port.to_string());
        }
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}
