//! Bounded reconnection with exponential backoff.

use std::time::Duration;

use crate::error::ConnectError;

/// Configuration for reconnection behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Total attempts, including the first one
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

/// Attempt budget for one logical operation.
///
/// Call `next_delay` after every failed attempt. It returns how long to wait
/// before the next attempt, or `None` once the budget is spent.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    current_delay: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            failures: 0,
            config,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }

        let delay = self.current_delay;
        // Saturate at the cap instead of overflowing Duration
        self.current_delay = Duration::try_from_secs_f64(
            self.current_delay.as_secs_f64() * self.config.multiplier,
        )
        .map_or(self.config.max_delay, |next| next.min(self.config.max_delay));

        Some(delay)
    }

    /// Number of the attempt about to run (1-based)
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.failures = 0;
    }
}

/// Classify the stderr of a failed ssh invocation.
///
/// Authentication and host key problems are fatal. Everything else
/// (refused, unreachable, timeouts, unknown exits) is treated as transient.
pub fn classify_ssh_failure(stderr: &str) -> ConnectError {
    let lower = stderr.to_lowercase();

    let fatal_patterns = [
        "permission denied",
        "authentication failed",
        "auth fail",
        "host key verification failed",
        "no supported authentication",
        "too many authentication failures",
        "key rejected",
        "publickey denied",
        "invalid format",
        "load key",
        "no such identity",
        "bad permissions",
    ];

    let message = last_meaningful_line(stderr);
    if fatal_patterns.iter().any(|p| lower.contains(p)) {
        ConnectError::Authentication(message)
    } else {
        ConnectError::Network(message)
    }
}

fn last_meaningful_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Warning: Permanently added"))
        .last()
        .unwrap_or("ssh exited without output")
        .to_string()
}
