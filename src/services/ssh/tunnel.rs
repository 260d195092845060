//! SSH tunnel implementation using the system ssh binary.
//!
//! One ControlMaster session (`ssh -M -N`) is held open to the bastion. The
//! local forwarding listener is bound by this process on an OS-assigned port,
//! and every accepted connection is carried to the database through the
//! master with `ssh -W host:port`. Using the system binary keeps host key
//! handling, ciphers and keepalives identical to what operators get from a
//! shell.

use super::forward::{LocalForwarder, Relay, RelayStream};
use super::manager::{TunnelConnector, TunnelSession};
use super::reconnect::classify_ssh_failure;
use super::types::SshTunnelConfig;
use crate::error::ConnectError;
use async_trait::async_trait;
use futures::StreamExt;
use smol::Task;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::process::{Child, Command, Stdio};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// An active bastion session plus the local listener forwarding through it.
pub struct SshTunnel {
    config: SshTunnelConfig,
    master: Child,
    forwarder: LocalForwarder,
    control_path: PathBuf,
    _stderr: Task<String>,
    _temp_dir: tempfile::TempDir,
}

impl SshTunnel {
    /// Start the master session and bind the forwarding listener.
    ///
    /// Waits until the master answers `-O check` or exits. Callers bound
    /// the wait; `TunnelManager` does so with its establishment timeout.
    pub async fn start(config: SshTunnelConfig) -> Result<Self, ConnectError> {
        let temp_dir = tempfile::Builder::new()
            .prefix("dbtunnel-ssh-")
            .tempdir()
            .map_err(|e| ConnectError::Network(format!("Failed to create temp directory: {}", e)))?;
        let control_path = temp_dir.path().join("ctl.sock");

        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        // Master mode, no remote command, no port forwards of its own
        cmd.arg("-M").arg("-N");
        cmd.arg("-S").arg(&control_path);
        cmd.args(["-o", "ControlPersist=no"]);
        cmd.args(["-o", "ExitOnForwardFailure=yes"]);

        // Only the configured key: no agent fallback, no default key scanning
        cmd.args(["-o", "IdentitiesOnly=yes"]);
        cmd.args(["-o", "IdentityAgent=none"]);
        cmd.arg("-i").arg(&config.private_key_path);

        cmd.arg("-o").arg(format!(
            "ServerAliveInterval={}",
            config.keepalive_interval.as_secs().max(1)
        ));
        cmd.args(["-o", "ServerAliveCountMax=3"]);
        cmd.args(config.common_args());
        cmd.arg(config.ssh_url());

        tracing::info!(
            "Starting SSH session to {} (port {}) for {}",
            config.ssh_url(),
            config.ssh_port,
            config.remote_target()
        );
        tracing::debug!("Full SSH command: {:?}", cmd);

        let mut master = cmd
            .spawn()
            .map_err(|e| ConnectError::Network(format!("Failed to spawn ssh process: {}", e)))?;

        let stderr_task = match master.stderr.take() {
            Some(stderr) => smol::spawn(collect_stderr(stderr)),
            None => smol::spawn(async { String::new() }),
        };

        // Unbounded here: TunnelManager holds the establishment timeout, and
        // dropping this future kills the master through kill_on_drop.
        loop {
            match master.try_status() {
                Ok(Some(status)) => {
                    let stderr = stderr_task.await;
                    let err = classify_ssh_failure(&stderr);
                    tracing::warn!(
                        "SSH session to {} exited with {}: {}",
                        config.ssh_url(),
                        status,
                        err
                    );
                    return Err(err);
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(ConnectError::Network(format!(
                        "Failed to poll ssh process: {}",
                        e
                    )));
                }
            }

            if control_path.exists() && control_check(&config, &control_path).await {
                break;
            }

            smol::Timer::after(READY_POLL_INTERVAL).await;
        }

        let relay = Arc::new(SshStdioRelay {
            config: config.clone(),
            control_path: control_path.clone(),
        });
        let forwarder = match LocalForwarder::bind(&config.local_bind_host, relay).await {
            Ok(forwarder) => forwarder,
            Err(e) => {
                let _ = master.kill();
                return Err(ConnectError::Network(format!(
                    "Failed to bind forwarding listener on {}: {}",
                    config.local_bind_host, e
                )));
            }
        };

        tracing::debug!(
            "SSH tunnel established: {} -> {}",
            forwarder.local_addr(),
            config.remote_target()
        );

        Ok(Self {
            config,
            master,
            forwarder,
            control_path,
            _stderr: stderr_task,
            _temp_dir: temp_dir,
        })
    }

    /// Get the local address to connect to (e.g., 127.0.0.1:49731).
    pub fn local_addr(&self) -> SocketAddr {
        self.forwarder.local_addr()
    }

    pub fn local_port(&self) -> u16 {
        self.forwarder.local_addr().port()
    }

    /// Master process still running and listener still accepting.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.master.try_status(), Ok(None)) && self.forwarder.is_running()
    }

    /// Shutdown the tunnel gracefully.
    pub async fn shutdown(&mut self) {
        tracing::debug!("Shutting down SSH tunnel to {}", self.config.ssh_url());

        self.forwarder.shutdown().await;

        // Ask the master to exit over its control socket first
        if matches!(self.master.try_status(), Ok(None)) {
            let _ = Command::new("ssh")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .arg("-S")
                .arg(&self.control_path)
                .args(["-O", "exit"])
                .arg(self.config.ssh_url())
                .status()
                .await;

            self.wait_exit(EXIT_GRACE).await;
        }

        if matches!(self.master.try_status(), Ok(None)) {
            // SAFETY: plain kill(2) on our own child's pid
            unsafe {
                libc::kill(self.master.id() as libc::pid_t, libc::SIGTERM);
            }
            self.wait_exit(EXIT_GRACE).await;
        }

        // Force kill if still running
        if matches!(self.master.try_status(), Ok(None)) {
            let _ = self.master.kill();
        }

        // Wait for process to fully exit
        let _ = self.master.status().await;

        tracing::info!("SSH tunnel on local port {} closed", self.local_port());
    }

    async fn wait_exit(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while matches!(self.master.try_status(), Ok(None)) && Instant::now() < deadline {
            smol::Timer::after(Duration::from_millis(50)).await;
        }
    }

    /// Test SSH login without starting a tunnel.
    /// This verifies we can reach and authenticate to the bastion.
    pub async fn test_ssh_connection(config: &SshTunnelConfig) -> Result<(), ConnectError> {
        let mut cmd = Command::new("ssh");

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.args(["-o", "IdentitiesOnly=yes"]);
        cmd.args(["-o", "IdentityAgent=none"]);
        cmd.arg("-i").arg(&config.private_key_path);
        cmd.args(config.common_args());
        cmd.arg(config.ssh_url());
        cmd.arg("exit");
        cmd.arg("0");

        tracing::debug!("Testing SSH connection: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| ConnectError::Network(format!("Failed to execute ssh: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_ssh_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        // Ensure process is killed when tunnel is dropped
        let _ = self.master.kill();
    }
}

#[async_trait]
impl TunnelSession for SshTunnel {
    fn local_addr(&self) -> SocketAddr {
        SshTunnel::local_addr(self)
    }

    fn is_alive(&mut self) -> bool {
        SshTunnel::is_alive(self)
    }

    async fn shutdown(mut self: Box<Self>) {
        SshTunnel::shutdown(&mut self).await;
    }
}

/// Opens `SshTunnel`s for the tunnel manager.
pub struct SshConnector {
    config: SshTunnelConfig,
}

impl SshConnector {
    pub fn new(config: SshTunnelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, ConnectError> {
        let tunnel = SshTunnel::start(self.config.clone()).await?;
        Ok(Box::new(tunnel))
    }
}

/// Carries one forwarded connection over the master with `ssh -W`.
struct SshStdioRelay {
    config: SshTunnelConfig,
    control_path: PathBuf,
}

#[async_trait]
impl Relay for SshStdioRelay {
    async fn open(&self) -> io::Result<RelayStream> {
        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        cmd.arg("-S").arg(&self.control_path);
        cmd.args(["-o", "ControlMaster=no"]);
        cmd.args(self.config.common_args());
        cmd.arg("-W").arg(self.config.remote_target());
        cmd.arg(self.config.ssh_url());

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ssh -W stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ssh -W stdout not captured"))?;

        Ok(RelayStream::new(stdout, stdin).with_child(child))
    }
}

/// `ssh -O check` against the control socket.
async fn control_check(config: &SshTunnelConfig, control_path: &Path) -> bool {
    Command::new("ssh")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .arg("-S")
        .arg(control_path)
        .args(["-O", "check"])
        .arg(config.ssh_url())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn collect_stderr(stderr: smol::process::ChildStderr) -> String {
    let mut collected = String::new();
    let mut lines = BufReader::new(stderr).lines();
    while let Some(result) = lines.next().await {
        match result {
            Ok(line) => {
                tracing::debug!("SSH stderr: {}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
            Err(e) => {
                tracing::debug!("SSH stderr read error: {}", e);
                break;
            }
        }
    }
    collected
}
