//! Local forwarding listener.
//!
//! The listener binds `host:0` so the OS hands out a free ephemeral port, and
//! keeps that socket for its whole lifetime. Several processes on one machine
//! can each run their own forwarder without coordinating. Every accepted
//! connection is piped to a stream opened through a [`Relay`].

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use smol::Task;
use smol::net::{TcpListener, TcpStream};
use smol::process::Child;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A byte stream to the remote end, plus whatever must stay alive while it is used.
pub struct RelayStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Dropped (and killed) when the relayed connection ends
    guard: Option<Child>,
}

impl RelayStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: None,
        }
    }

    /// Tie a child process to the stream's lifetime.
    pub fn with_child(mut self, child: Child) -> Self {
        self.guard = Some(child);
        self
    }
}

/// Opens one stream to the forwarding target per accepted local connection.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn open(&self) -> io::Result<RelayStream>;
}

/// A bound listener and the task accepting on it.
pub struct LocalForwarder {
    local_addr: SocketAddr,
    accept_task: Option<Task<()>>,
}

impl LocalForwarder {
    /// Bind `host:0` and start accepting.
    pub async fn bind(host: &str, relay: Arc<dyn Relay>) -> io::Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!("Forwarding listener bound on {}", local_addr);

        let accept_task = smol::spawn(accept_loop(listener, relay));
        Ok(Self {
            local_addr,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once the accept loop has stopped or the forwarder was shut down.
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting and drop every in-flight relay. The port is released
    /// when this returns.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.cancel().await;
            tracing::debug!("Forwarding listener on {} closed", self.local_addr);
        }
    }
}

async fn accept_loop(listener: TcpListener, relay: Arc<dyn Relay>) {
    // Owned here so cancelling the loop also cancels the relays
    let mut connections: Vec<Task<()>> = Vec::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                connections.retain(|task| !task.is_finished());
                let relay = relay.clone();
                connections.push(smol::spawn(async move {
                    if let Err(e) = pipe(stream, relay).await {
                        tracing::debug!("Relay for {} ended with error: {}", peer, e);
                    }
                }));
            }
            Err(e) if is_transient_accept_error(&e) => {
                tracing::warn!("Forwarding listener accept failed, retrying: {}", e);
                smol::Timer::after(ACCEPT_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::warn!("Forwarding listener stopped accepting: {}", e);
                break;
            }
        }
    }
}

/// Errors about one pending connection or a momentary resource shortage.
/// The listener itself is still fine after these.
fn is_transient_accept_error(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::OutOfMemory => true,
        _ => matches!(
            err.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
        ),
    }
}

async fn pipe(local: TcpStream, relay: Arc<dyn Relay>) -> io::Result<()> {
    let RelayStream {
        mut reader,
        mut writer,
        guard: _guard,
    } = relay.open().await?;

    let mut local_read = local.clone();
    let mut local_write = local;

    let upstream = async {
        futures::io::copy(&mut local_read, &mut writer).await?;
        writer.close().await
    };
    let downstream = async {
        futures::io::copy(&mut reader, &mut local_write).await?;
        local_write.shutdown(Shutdown::Write)
    };

    futures::future::try_join(upstream, downstream).await?;
    Ok(())
}
