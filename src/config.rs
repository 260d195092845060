//! Process configuration.
//!
//! Loaded once at startup, from the environment or a JSON file, and never
//! mutated afterwards. Everything below this module borrows from it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::ssh::{ReconnectConfig, SshTunnelConfig};

const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// How to reach the bastion host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BastionConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default = "default_key_path")]
    pub private_key_path: PathBuf,
    /// Extra `-o Key=Value` options handed to ssh
    #[serde(default)]
    pub extra_options: Vec<String>,
}

/// The database reached through the tunnel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Host as seen from the bastion
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub name: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .finish()
    }
}

/// Operational tuning for retries and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Total attempts per `execute` call
    pub retry_count: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    /// Host the forwarding listener binds to; the port is always OS-assigned
    pub local_bind_host: String,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 30_000,
            connect_timeout_secs: 5,
            query_timeout_secs: 30,
            keepalive_interval_secs: 15,
            local_bind_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub bastion: BastionConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_db_port() -> u16 {
    3306
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("id_rsa"))
        .unwrap_or_else(|| PathBuf::from("id_rsa"))
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an arbitrary key lookup. `from_env` is this over `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("Missing required setting {}", key))
        };
        let parsed = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{} must be a non-negative integer, got {:?}", key, v))
                })
                .transpose()
        };
        let port = |key: &str, default: u16| -> Result<u16> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{} must be a port number, got {:?}", key, v)),
                None => Ok(default),
            }
        };

        let defaults = TuningConfig::default();
        let tuning = TuningConfig {
            retry_count: match lookup("DB_RETRY_COUNT") {
                Some(v) => v.trim().parse::<u32>().with_context(|| {
                    format!("DB_RETRY_COUNT must be a non-negative integer, got {:?}", v)
                })?,
                None => defaults.retry_count,
            },
            backoff_base_ms: parsed("DB_BACKOFF_BASE_MS")?.unwrap_or(defaults.backoff_base_ms),
            backoff_max_ms: parsed("DB_BACKOFF_MAX_MS")?.unwrap_or(defaults.backoff_max_ms),
            connect_timeout_secs: parsed("DB_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.connect_timeout_secs),
            query_timeout_secs: parsed("DB_QUERY_TIMEOUT_SECS")?
                .unwrap_or(defaults.query_timeout_secs),
            keepalive_interval_secs: parsed("SSH_KEEPALIVE_SECS")?
                .unwrap_or(defaults.keepalive_interval_secs),
            local_bind_host: lookup("TUNNEL_LOCAL_HOST").unwrap_or(defaults.local_bind_host),
            backoff_multiplier: defaults.backoff_multiplier,
        };

        let config = Config {
            bastion: BastionConfig {
                host: required("SSH_HOST")?,
                port: port("SSH_PORT", default_ssh_port())?,
                user: required("SSH_USER")?,
                private_key_path: lookup("SSH_KEY_PATH")
                    .map(|p| expand_home(&p))
                    .unwrap_or_else(default_key_path),
                extra_options: lookup("SSH_EXTRA_OPTIONS")
                    .map(|v| v.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            },
            database: DatabaseConfig {
                host: required("DB_HOST")?,
                port: port("DB_PORT", default_db_port())?,
                user: required("DB_USER")?,
                password: lookup("DB_PASSWORD").unwrap_or_default(),
                name: required("DB_NAME")?,
            },
            tuning,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the retry loop or timeouts meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.bastion.host.trim().is_empty() || self.bastion.user.trim().is_empty() {
            anyhow::bail!("Bastion host and user must be set");
        }
        if self.database.host.trim().is_empty()
            || self.database.user.trim().is_empty()
            || self.database.name.trim().is_empty()
        {
            anyhow::bail!("Database host, user and name must be set");
        }
        if self.tuning.retry_count == 0 {
            anyhow::bail!("Retry count must be at least 1");
        }
        if self.tuning.connect_timeout_secs == 0 || self.tuning.query_timeout_secs == 0 {
            anyhow::bail!("Connect and query timeouts must be non-zero");
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.tuning.backoff_multiplier) {
            anyhow::bail!(
                "Backoff multiplier must be between 1.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER,
                self.tuning.backoff_multiplier
            );
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.connect_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.tuning.query_timeout_secs)
    }

    /// Backoff policy for one `execute` call.
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.tuning.backoff_base_ms),
            max_delay: Duration::from_millis(self.tuning.backoff_max_ms),
            multiplier: self.tuning.backoff_multiplier,
            max_attempts: self.tuning.retry_count,
        }
    }

    /// Tunnel parameters derived from the bastion and database sections.
    pub fn tunnel_config(&self) -> SshTunnelConfig {
        SshTunnelConfig {
            ssh_host: self.bastion.host.clone(),
            ssh_port: self.bastion.port,
            ssh_user: self.bastion.user.clone(),
            private_key_path: self.bastion.private_key_path.clone(),
            remote_host: self.database.host.clone(),
            remote_port: self.database.port,
            local_bind_host: self.tuning.local_bind_host.clone(),
            connect_timeout: self.connect_timeout(),
            keepalive_interval: Duration::from_secs(self.tuning.keepalive_interval_secs),
            extra_options: self.bastion.extra_options.clone(),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
