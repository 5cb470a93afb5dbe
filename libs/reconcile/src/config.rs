use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default time a matched worker has to claim its offer.
pub const DEFAULT_WORKER_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable overriding the worker queue timeout, in seconds.
pub const WORKER_QUEUE_TIMEOUT_ENV: &str = "QSCHED_WORKER_QUEUE_TIMEOUT_SECS";

// Out-of-range timeouts saturate here rather than overflow time arithmetic.
const MAX_TIMEOUT_WEEKS: i64 = 52 * 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// How long a lease is honored, and how long label-matching workers keep
    /// exclusive access to a request before any idle worker may take it.
    pub worker_queue_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            worker_queue_timeout: DEFAULT_WORKER_QUEUE_TIMEOUT,
        }
    }
}

impl ReconcilerConfig {
    pub fn new(worker_queue_timeout: Duration) -> Self {
        Self {
            worker_queue_timeout,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker_queue_timeout = match lookup(WORKER_QUEUE_TIMEOUT_ENV) {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidValue {
                        var: WORKER_QUEUE_TIMEOUT_ENV,
                        value: raw.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_WORKER_QUEUE_TIMEOUT,
        };

        Ok(Self {
            worker_queue_timeout,
        })
    }

    /// The timeout as a signed duration for timestamp arithmetic.
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.worker_queue_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(MAX_TIMEOUT_WEEKS))
            .min(chrono::Duration::weeks(MAX_TIMEOUT_WEEKS))
    }
}
