//! MySQL driver over sqlx.

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection, Row as _, TypeInfo, ValueRef};
use std::net::SocketAddr;
use std::sync::Arc;

use super::driver::{DatabaseConnection, DatabaseDriver};
use super::types::{Row, Value};
use crate::config::DatabaseConfig;
use crate::error::{ConnectError, QueryFailure};

/// Server error numbers that mean "these credentials will never work".
const ACCESS_DENIED_DB: u16 = 1044;
const ACCESS_DENIED_USER: u16 = 1045;
const UNKNOWN_DATABASE: u16 = 1049;

/// Server error numbers that mean the connection itself is gone.
const SERVER_SHUTDOWN: u16 = 1053;
const SERVER_GONE: u16 = 2006;
const SERVER_LOST: u16 = 2013;

pub struct MySqlDriver {
    config: DatabaseConfig,
}

impl MySqlDriver {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn options(&self, addr: SocketAddr) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&addr.ip().to_string())
            .port(addr.port())
            .username(&self.config.user)
            .password(&self.config.password)
            .database(&self.config.name)
    }
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn DatabaseConnection>, ConnectError> {
        let conn = self
            .options(addr)
            .connect()
            .await
            .map_err(classify_connect_error)?;
        Ok(Box::new(MySqlSession { conn }))
    }
}

struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl DatabaseConnection for MySqlSession {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, QueryFailure> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value.clone());
        }

        let rows = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(classify_query_error)?;

        convert_rows(&rows).map_err(|e| QueryFailure::Rejected(format!("Failed to decode row: {}", e)))
    }

    async fn ping(&mut self) -> Result<(), QueryFailure> {
        self.conn.ping().await.map_err(classify_query_error)
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            tracing::debug!("Error closing database connection: {}", e);
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(v),
        Value::Int(v) => query.bind(v),
        Value::UInt(v) => query.bind(v),
        Value::Float(v) => query.bind(v),
        Value::Decimal(v) => query.bind(v),
        Value::Text(v) => query.bind(v),
        Value::Bytes(v) => query.bind(v),
        Value::Date(v) => query.bind(v),
        Value::Time(v) => query.bind(v),
        Value::DateTime(v) => query.bind(v),
    }
}

fn convert_rows(rows: &[MySqlRow]) -> Result<Vec<Row>, sqlx::Error> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };

    let columns: Arc<[String]> = first
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();

    rows.iter()
        .map(|row| {
            let values = (0..columns.len())
                .map(|idx| decode_value(row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Row::new(columns.clone(), values))
        })
        .collect()
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_uppercase();

    let decoded = match type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).map(Value::Int)
        }
        t if t.ends_with("UNSIGNED") => row.try_get::<u64, _>(idx).map(Value::UInt),
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| Value::Float(v as f64)),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(Value::Float),
        "DECIMAL" => row.try_get::<rust_decimal::Decimal, _>(idx).map(Value::Decimal),
        "DATE" => row.try_get::<chrono::NaiveDate, _>(idx).map(Value::Date),
        "TIME" => row.try_get::<chrono::NaiveTime, _>(idx).map(Value::Time),
        "DATETIME" | "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(Value::DateTime),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            row.try_get::<Vec<u8>, _>(idx).map(Value::Bytes)
        }
        _ => row.try_get::<String, _>(idx).map(Value::Text),
    };

    decoded.or_else(|_| fallback_value(row, idx))
}

/// Last resort for types the match above does not cover (YEAR, BIT, odd TIME
/// ranges): integer, then text, then raw bytes.
fn fallback_value(row: &MySqlRow, idx: usize) -> Result<Value, sqlx::Error> {
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(Value::Int(v));
    }
    if let Ok(v) = row.try_get::<u64, _>(idx) {
        return Ok(Value::UInt(v));
    }
    if let Ok(v) = row.try_get_unchecked::<String, _>(idx) {
        return Ok(Value::Text(v));
    }
    row.try_get_unchecked::<Vec<u8>, _>(idx).map(Value::Bytes)
}

fn server_error_number(err: &sqlx::Error) -> Option<u16> {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(|e| e.number()),
        _ => None,
    }
}

/// Map a connect-time error onto the retryable/fatal split.
pub(crate) fn classify_connect_error(err: sqlx::Error) -> ConnectError {
    match server_error_number(&err) {
        Some(ACCESS_DENIED_DB | ACCESS_DENIED_USER | UNKNOWN_DATABASE) => {
            return ConnectError::Authentication(database_message(&err));
        }
        Some(_) => return ConnectError::Network(database_message(&err)),
        None => {}
    }
    match err {
        sqlx::Error::Configuration(e) => {
            ConnectError::Authentication(format!("invalid connection settings: {}", e))
        }
        other => ConnectError::Network(other.to_string()),
    }
}

/// Map a statement error onto connection-lost vs rejected.
pub(crate) fn classify_query_error(err: sqlx::Error) -> QueryFailure {
    if let Some(number) = server_error_number(&err) {
        return match number {
            SERVER_SHUTDOWN | SERVER_GONE | SERVER_LOST => {
                QueryFailure::ConnectionLost(database_message(&err))
            }
            _ => QueryFailure::Rejected(database_message(&err)),
        };
    }
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => QueryFailure::ConnectionLost(err.to_string()),
        other => QueryFailure::Rejected(other.to_string()),
    }
}

fn database_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}
