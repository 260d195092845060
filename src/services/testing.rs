//! In-process stand-ins for the ssh transport and the database driver.

use async_trait::async_trait;
use smol::Task;
use smol::net::{TcpListener, TcpStream};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ConnectError, QueryFailure};
use crate::services::database::{DatabaseConnection, DatabaseDriver, Row, Value};
use crate::services::ssh::{LocalForwarder, Relay, RelayStream, TunnelConnector, TunnelSession};

/// Relays straight to a TCP address.
pub struct TcpRelay(pub SocketAddr);

#[async_trait]
impl Relay for TcpRelay {
    async fn open(&self) -> io::Result<RelayStream> {
        let stream = TcpStream::connect(self.0).await?;
        Ok(RelayStream::new(stream.clone(), stream))
    }
}

/// Echo server on an ephemeral port. Stops when the task is dropped.
pub async fn spawn_echo_server() -> (SocketAddr, Task<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = smol::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            smol::spawn(async move {
                let mut reader = stream.clone();
                let mut writer = stream;
                let _ = futures::io::copy(&mut reader, &mut writer).await;
            })
            .detach();
        }
    });
    (addr, task)
}

/// Connector whose sessions are flags. `kill_sessions` makes every open
/// session report dead.
pub struct MockConnector {
    opens: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    next_port: AtomicU16,
    sessions: Mutex<Vec<Arc<AtomicBool>>>,
    failures: Mutex<VecDeque<ConnectError>>,
    open_delay: Mutex<Option<Duration>>,
    open_times: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            next_port: AtomicU16::new(41000),
            sessions: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(None),
            open_times: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap().clone()
    }

    pub fn kill_sessions(&self) {
        for alive in self.sessions.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Queue a failure for the next `open`.
    pub fn fail_next(&self, err: ConnectError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl TunnelConnector for MockConnector {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, ConnectError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().unwrap().push(Instant::now());

        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            smol::Timer::after(delay).await;
        }

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.sessions.lock().unwrap().push(alive.clone());
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            local_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            alive,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

struct MockSession {
    local_addr: SocketAddr,
    alive: Arc<AtomicBool>,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelSession for MockSession {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(self: Box<Self>) {
        self.alive.store(false, Ordering::SeqCst);
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector backed by a real `LocalForwarder` relaying to a TCP address.
pub struct ForwardingConnector {
    target: SocketAddr,
}

impl ForwardingConnector {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl TunnelConnector for ForwardingConnector {
    async fn open(&self) -> Result<Box<dyn TunnelSession>, ConnectError> {
        let forwarder = LocalForwarder::bind("127.0.0.1", Arc::new(TcpRelay(self.target)))
            .await
            .map_err(|e| ConnectError::Network(e.to_string()))?;
        Ok(Box::new(ForwardingSession { forwarder }))
    }
}

struct ForwardingSession {
    forwarder: LocalForwarder,
}

#[async_trait]
impl TunnelSession for ForwardingSession {
    fn local_addr(&self) -> SocketAddr {
        self.forwarder.local_addr()
    }

    fn is_alive(&mut self) -> bool {
        self.forwarder.is_running()
    }

    async fn shutdown(mut self: Box<Self>) {
        self.forwarder.shutdown().await;
    }
}

enum ScriptedQuery {
    Lose,
    Reject(String),
    Stall(Duration),
}

#[derive(Default)]
struct DriverState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    queries: AtomicUsize,
    reentries: AtomicUsize,
    in_query: AtomicBool,
    fail_pings: AtomicBool,
    connect_failures: Mutex<VecDeque<ConnectError>>,
    connect_delay: Mutex<Option<Duration>>,
    query_delay: Mutex<Option<Duration>>,
    script: Mutex<VecDeque<ScriptedQuery>>,
    last_query: Mutex<Option<(String, Vec<Value>)>>,
}

/// Driver whose connections answer every statement with a single `1` row
/// unless a failure has been scripted.
pub struct MockDriver {
    state: Arc<DriverState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(DriverState::default()),
        }
    }

    /// Connect calls started, including failed and timed-out ones
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::SeqCst)
    }

    /// Times a query started while another was still running
    pub fn reentries(&self) -> usize {
        self.state.reentries.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<(String, Vec<Value>)> {
        self.state.last_query.lock().unwrap().clone()
    }

    pub fn fail_next(&self, err: ConnectError) {
        self.state.connect_failures.lock().unwrap().push_back(err);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.state.query_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn lose_connection_on_next_queries(&self, count: usize) {
        let mut script = self.state.script.lock().unwrap();
        script.extend((0..count).map(|_| ScriptedQuery::Lose));
    }

    pub fn reject_next_query(&self, message: &str) {
        self.state
            .script
            .lock()
            .unwrap()
            .push_back(ScriptedQuery::Reject(message.to_string()));
    }

    pub fn stall_next_queries(&self, count: usize, stall: Duration) {
        let mut script = self.state.script.lock().unwrap();
        script.extend((0..count).map(|_| ScriptedQuery::Stall(stall)));
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    async fn connect(&self, _addr: SocketAddr) -> Result<Box<dyn DatabaseConnection>, ConnectError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            smol::Timer::after(delay).await;
        }

        let failure = self.state.connect_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<DriverState>,
}

struct InQuery<'a>(&'a DriverState);

impl<'a> InQuery<'a> {
    fn enter(state: &'a DriverState) -> Self {
        if state.in_query.swap(true, Ordering::SeqCst) {
            state.reentries.fetch_add(1, Ordering::SeqCst);
        }
        Self(state)
    }
}

impl Drop for InQuery<'_> {
    fn drop(&mut self) {
        self.0.in_query.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseConnection for MockConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryFailure> {
        let state = self.state.clone();
        let _in_query = InQuery::enter(&state);
        state.queries.fetch_add(1, Ordering::SeqCst);
        *state.last_query.lock().unwrap() = Some((sql.to_string(), params.to_vec()));

        let delay = *state.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            smol::Timer::after(delay).await;
        }

        let scripted = state.script.lock().unwrap().pop_front();
        match scripted {
            Some(ScriptedQuery::Lose) => {
                return Err(QueryFailure::ConnectionLost(
                    "Lost connection to MySQL server during query".to_string(),
                ));
            }
            Some(ScriptedQuery::Reject(message)) => return Err(QueryFailure::Rejected(message)),
            Some(ScriptedQuery::Stall(stall)) => {
                smol::Timer::after(stall).await;
            }
            None => {}
        }

        let columns: Arc<[String]> = Arc::from(vec!["1".to_string()]);
        Ok(vec![Row::new(columns, vec![Value::Int(1)])])
    }

    async fn ping(&mut self) -> Result<(), QueryFailure> {
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(QueryFailure::ConnectionLost("ping failed".to_string()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
