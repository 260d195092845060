//! The single entry point for running statements.
//!
//! All callers in a process share one `QueryGateway`. Calls are serialized
//! on one mutex for their whole duration (connect, retry and query), so the
//! supervised connection is never used by two callers at once.

use async_lock::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::driver::DatabaseDriver;
use super::mysql::MySqlDriver;
use super::supervisor::{ConnectionSupervisor, SupervisorState};
use super::types::{Params, Row};
use crate::config::Config;
use crate::error::{ConnectError, GatewayError, QueryFailure};
use crate::services::ssh::{
    ExponentialBackoff, ReconnectConfig, SshConnector, TunnelConnector, TunnelManager,
};
use crate::services::timeout::with_timeout;

pub struct QueryGateway {
    inner: Mutex<Option<ConnectionSupervisor>>,
    reconnect: ReconnectConfig,
    query_timeout: Duration,
}

impl QueryGateway {
    /// Wire the production stack: system ssh tunnel plus MySQL over sqlx.
    /// Nothing connects until the first `execute`.
    pub fn new(config: &Config) -> Self {
        let connector: Arc<dyn TunnelConnector> = Arc::new(SshConnector::new(config.tunnel_config()));
        let driver: Arc<dyn DatabaseDriver> = Arc::new(MySqlDriver::new(config.database.clone()));
        Self::with_parts(
            connector,
            driver,
            config.reconnect_config(),
            config.connect_timeout(),
            config.query_timeout(),
        )
    }

    /// Build from explicit seams.
    pub fn with_parts(
        connector: Arc<dyn TunnelConnector>,
        driver: Arc<dyn DatabaseDriver>,
        reconnect: ReconnectConfig,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        // The ssh session and the database handshake each get the full connect timeout
        let tunnels = TunnelManager::new(connector, connect_timeout);
        let supervisor =
            ConnectionSupervisor::new(tunnels, driver, reconnect.clone(), connect_timeout);
        Self {
            inner: Mutex::new(Some(supervisor)),
            reconnect,
            query_timeout,
        }
    }

    /// Run one statement and return its rows.
    ///
    /// Connection loss is retried on a rebuilt connection within the
    /// configured attempt budget. Statements the database rejects are
    /// returned at once.
    pub async fn execute(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<Vec<Row>, GatewayError> {
        let (sql, values) = params
            .into()
            .resolve(sql)
            .map_err(|e| GatewayError::Query {
                message: e.to_string(),
            })?;

        let mut guard = self.inner.lock().await;
        let supervisor = guard.as_mut().ok_or(GatewayError::Closed)?;
        let mut backoff = ExponentialBackoff::new(self.reconnect.clone());

        loop {
            let conn = match supervisor.get_connection_with(&mut backoff).await {
                Ok(conn) => conn,
                Err(ConnectError::Authentication(message)) => {
                    return Err(GatewayError::Authentication { message });
                }
                Err(ConnectError::Network(message)) => {
                    return Err(GatewayError::Connection {
                        attempts: backoff.failures(),
                        message,
                    });
                }
            };

            let outcome = match with_timeout(self.query_timeout, conn.query(&sql, &values)).await {
                Some(outcome) => outcome,
                None => Err(QueryFailure::ConnectionLost(format!(
                    "query timed out after {:?}",
                    self.query_timeout
                ))),
            };

            let message = match outcome {
                Ok(rows) => return Ok(rows),
                Err(QueryFailure::Rejected(message)) => {
                    return Err(GatewayError::Query { message });
                }
                Err(QueryFailure::ConnectionLost(message)) => message,
            };

            supervisor.mark_broken();
            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "Connection lost during query ({}); retrying in {:?}",
                        message,
                        delay
                    );
                    smol::Timer::after(delay).await;
                }
                None => {
                    tracing::error!(
                        "Connection lost during query, giving up after {} attempts: {}",
                        backoff.failures(),
                        message
                    );
                    return Err(GatewayError::Connection {
                        attempts: backoff.failures(),
                        message,
                    });
                }
            }
        }
    }

    /// Blocking form of `execute` for thread-per-request callers.
    pub fn execute_blocking(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> Result<Vec<Row>, GatewayError> {
        smol::block_on(self.execute(sql, params))
    }

    /// Force the next `execute` to reconnect.
    pub async fn mark_broken(&self) {
        if let Some(supervisor) = self.inner.lock().await.as_mut() {
            supervisor.mark_broken();
        }
    }

    /// Ping the current connection without running a statement.
    pub async fn health_check(&self) -> bool {
        match self.inner.lock().await.as_mut() {
            Some(supervisor) => supervisor.health_check().await,
            None => false,
        }
    }

    pub async fn state(&self) -> Option<SupervisorState> {
        self.inner.lock().await.as_ref().map(ConnectionSupervisor::state)
    }

    /// Close the connection and the tunnel. Later calls fail with `Closed`.
    pub async fn shutdown(&self) {
        let supervisor = self.inner.lock().await.take();
        if let Some(mut supervisor) = supervisor {
            supervisor.shutdown().await;
            tracing::info!("Query gateway shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Value;
    use crate::services::testing::{MockConnector, MockDriver};
    use std::time::Instant;

    fn gateway(
        connector: &Arc<MockConnector>,
        driver: &Arc<MockDriver>,
        retry_count: u32,
        base: Duration,
    ) -> QueryGateway {
        QueryGateway::with_parts(
            connector.clone(),
            driver.clone(),
            ReconnectConfig {
                initial_delay: base,
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                max_attempts: retry_count,
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_connection_reused_across_executes() {
        let connector = Arc::new(MockConnector::new());
        let driver = Arc::new(MockDriver::new());
        let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

        for _ in 0..10 {
            let rows = gw.execute_blocking("SELECT 1", ()).unwrap();
            assert_eq!(rows.len(), 1);
        }

        assert_eq!(connector.opens(), 1);
        assert_eq!(driver.connects(), 1);
        assert_eq!(driver.queries(), 10);
    }

    #[test]
    fn test_transparent_recovery_after_mark_broken() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

            gw.execute("SELECT 1", ()).await.unwrap();
            gw.mark_broken().await;
            gw.execute("SELECT 1", ()).await.unwrap();

            assert_eq!(driver.connects(), 2);
            assert_eq!(connector.opens(), 1);
            assert_eq!(gw.state().await.unwrap().connects, 2);
        });
    }

    #[test]
    fn test_connection_lost_mid_query_retries_same_statement() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            driver.lose_connection_on_next_queries(1);
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

            let rows = gw
                .execute("SELECT * FROM lots WHERE id = ?", vec![Value::Int(9)])
                .await
                .unwrap();

            assert_eq!(rows.len(), 1);
            assert_eq!(driver.queries(), 2);
            assert_eq!(driver.connects(), 2);
            assert_eq!(
                driver.last_query(),
                Some(("SELECT * FROM lots WHERE id = ?".to_string(), vec![Value::Int(9)]))
            );
        });
    }

    #[test]
    fn test_auth_failure_no_retry_no_backoff() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next(ConnectError::Authentication(
            "deploy@bastion: Permission denied (publickey).".into(),
        ));
        let driver = Arc::new(MockDriver::new());
        let gw = gateway(&connector, &driver, 3, Duration::from_millis(100));

        let start = Instant::now();
        let err = gw.execute_blocking("SELECT 1", ()).unwrap_err();

        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert!(err.is_infrastructure());
        assert_eq!(connector.opens(), 1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let connector = Arc::new(MockConnector::new());
        for _ in 0..10 {
            connector.fail_next(ConnectError::Network("No route to host".into()));
        }
        let driver = Arc::new(MockDriver::new());
        let gw = gateway(&connector, &driver, 3, Duration::from_millis(50));

        let err = gw.execute_blocking("SELECT 1", ()).unwrap_err();
        assert_eq!(
            err,
            GatewayError::Connection {
                attempts: 3,
                message: "No route to host".into()
            }
        );

        let attempts = connector.open_times();
        assert_eq!(attempts.len(), 3);
        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert!(first_gap >= Duration::from_millis(50));
        assert!(second_gap >= Duration::from_millis(100));
        assert!(second_gap > first_gap);
    }

    #[test]
    fn test_recovers_on_third_attempt_after_backoff() {
        let connector = Arc::new(MockConnector::new());
        connector.fail_next(ConnectError::Network("Connection timed out".into()));
        connector.fail_next(ConnectError::Network("Connection timed out".into()));
        let driver = Arc::new(MockDriver::new());
        let gw = gateway(&connector, &driver, 3, Duration::from_millis(100));

        let start = Instant::now();
        let rows = gw.execute_blocking("SELECT 1", ()).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(rows.len(), 1);
        assert_eq!(connector.opens(), 3);
        assert!(elapsed >= Duration::from_millis(300));
        // attempts x connect timeout
        assert!(elapsed < Duration::from_secs(3));
    }

    #[test]
    fn test_rejected_query_is_not_retried() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            driver.reject_next_query("You have an error in your SQL syntax");
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

            let err = gw.execute("SELEC 1", ()).await.unwrap_err();
            assert_eq!(
                err,
                GatewayError::Query {
                    message: "You have an error in your SQL syntax".into()
                }
            );
            assert!(!err.is_infrastructure());
            assert_eq!(driver.queries(), 1);
            // The connection is still good
            gw.execute("SELECT 1", ()).await.unwrap();
            assert_eq!(driver.connects(), 1);
        });
    }

    #[test]
    fn test_bad_parameters_fail_before_connecting() {
        let connector = Arc::new(MockConnector::new());
        let driver = Arc::new(MockDriver::new());
        let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

        let err = gw
            .execute_blocking("SELECT ?, ?", vec![Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, GatewayError::Query { .. }));
        assert_eq!(connector.opens(), 0);
    }

    #[test]
    fn test_query_timeout_marks_connection_broken() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            driver.stall_next_queries(1, Duration::from_secs(5));
            let gw = QueryGateway::with_parts(
                connector.clone(),
                driver.clone(),
                ReconnectConfig {
                    initial_delay: Duration::from_millis(10),
                    max_attempts: 2,
                    ..Default::default()
                },
                Duration::from_secs(1),
                Duration::from_millis(100),
            );

            gw.execute("SELECT SLEEP(10)", ()).await.unwrap();
            assert_eq!(driver.connects(), 2);
        });
    }

    #[test]
    fn test_persistent_connection_loss_exhausts_budget() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            driver.lose_connection_on_next_queries(10);
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

            let err = gw.execute("SELECT 1", ()).await.unwrap_err();
            assert!(matches!(err, GatewayError::Connection { attempts: 3, .. }));
            assert_eq!(driver.queries(), 3);
        });
    }

    #[test]
    fn test_tunnel_death_rebuilds_tunnel_and_connection() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));

            gw.execute("SELECT 1", ()).await.unwrap();
            let first_port = gw.state().await.unwrap().local_port;
            connector.kill_sessions();
            gw.execute("SELECT 1", ()).await.unwrap();

            assert_eq!(connector.opens(), 2);
            assert_eq!(driver.connects(), 2);
            assert_ne!(gw.state().await.unwrap().local_port, first_port);
        });
    }

    #[test]
    fn test_concurrent_callers_are_serialized() {
        let connector = Arc::new(MockConnector::new());
        let driver = Arc::new(MockDriver::new());
        driver.set_query_delay(Duration::from_millis(5));
        let gw = Arc::new(gateway(&connector, &driver, 3, Duration::from_millis(10)));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let gw = gw.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        gw.execute_blocking("SELECT 1", ()).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(driver.queries(), 40);
        assert_eq!(driver.reentries(), 0);
        assert_eq!(driver.connects(), 1);
    }

    #[test]
    fn test_shutdown_then_closed() {
        smol::block_on(async {
            let connector = Arc::new(MockConnector::new());
            let driver = Arc::new(MockDriver::new());
            let gw = gateway(&connector, &driver, 3, Duration::from_millis(10));
            gw.execute("SELECT 1", ()).await.unwrap();

            gw.shutdown().await;
            gw.shutdown().await;

            assert_eq!(gw.execute("SELECT 1", ()).await.unwrap_err(), GatewayError::Closed);
            assert_eq!(connector.shutdowns(), 1);
            assert_eq!(driver.closes(), 1);
            assert!(gw.state().await.is_none());
            assert!(!gw.health_check().await);
        });
    }
}
