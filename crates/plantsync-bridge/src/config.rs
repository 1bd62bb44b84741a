//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/plantsync";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default location of the local durable queue file.
pub const DEFAULT_QUEUE_PATH: &str = "./data/plantsync-queue.db";

/// Default interval between queue depth reports.
pub const DEFAULT_QUEUE_REPORT_INTERVAL_SECS: u64 = 10;

/// Pause before re-polling an empty queue.
pub const DEFAULT_DRAIN_POLL_INTERVAL_MS: u64 = 10;

/// Pause after every batch, even a fully healthy one.
pub const DEFAULT_DRAIN_BASE_PAUSE_MS: u64 = 100;

/// Extra pause per failed item in the previous batch.
pub const DEFAULT_DRAIN_PAUSE_PER_FAILURE_MS: u64 = 100;

/// Upper bound of the post-batch pause.
pub const DEFAULT_DRAIN_MAX_PAUSE_MS: u64 = 1000;

/// Ceiling on a single sink transaction (lock-hold bound, not an expectation).
pub const DEFAULT_SINK_TX_TIMEOUT_SECS: u64 = 60;

/// Delay before an unresolvable message is resubmitted.
pub const DEFAULT_INGEST_DEFER_DELAY_MS: u64 = 1000;

/// Resubmissions before a deferred message is parked in the fallback queue.
pub const DEFAULT_INGEST_DEFER_MAX_ATTEMPTS: u32 = 30;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub drain: DrainConfig,
    pub sink: SinkConfig,
    pub ingest: IngestConfig,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Local durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub report_interval_secs: u64,
}

/// Drain worker pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainConfig {
    pub poll_interval_ms: u64,
    pub base_pause_ms: u64,
    pub pause_per_failure_ms: u64,
    pub max_pause_ms: u64,
}

/// Sink writer configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SinkConfig {
    pub tx_timeout_secs: u64,
}

/// Ingest deferral configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestConfig {
    pub defer_delay_ms: u64,
    pub defer_max_attempts: u32,
}

impl DrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Post-batch pause for a batch with `failures` failed items:
    /// `min(base + per_failure * failures, max)`.
    pub fn backpressure(&self, failures: usize) -> Duration {
        let extra = self
            .pause_per_failure_ms
            .saturating_mul(u64::try_from(failures).unwrap_or(u64::MAX));
        Duration::from_millis(self.base_pause_ms.saturating_add(extra).min(self.max_pause_ms))
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_DRAIN_POLL_INTERVAL_MS,
            base_pause_ms: DEFAULT_DRAIN_BASE_PAUSE_MS,
            pause_per_failure_ms: DEFAULT_DRAIN_PAUSE_PER_FAILURE_MS,
            max_pause_ms: DEFAULT_DRAIN_MAX_PAUSE_MS,
        }
    }
}

impl SinkConfig {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            tx_timeout_secs: DEFAULT_SINK_TX_TIMEOUT_SECS,
        }
    }
}

impl IngestConfig {
    pub fn defer_delay(&self) -> Duration {
        Duration::from_millis(self.defer_delay_ms)
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            defer_delay_ms: DEFAULT_INGEST_DEFER_DELAY_MS,
            defer_max_attempts: DEFAULT_INGEST_DEFER_MAX_ATTEMPTS,
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            queue: QueueConfig {
                path: std::env::var("QUEUE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_PATH)),
                report_interval_secs: env_or(
                    "QUEUE_REPORT_INTERVAL_SECS",
                    DEFAULT_QUEUE_REPORT_INTERVAL_SECS,
                ),
            },
            drain: DrainConfig {
                poll_interval_ms: env_or("DRAIN_POLL_INTERVAL_MS", DEFAULT_DRAIN_POLL_INTERVAL_MS),
                base_pause_ms: env_or("DRAIN_BASE_PAUSE_MS", DEFAULT_DRAIN_BASE_PAUSE_MS),
                pause_per_failure_ms: env_or(
                    "DRAIN_PAUSE_PER_FAILURE_MS",
                    DEFAULT_DRAIN_PAUSE_PER_FAILURE_MS,
                ),
                max_pause_ms: env_or("DRAIN_MAX_PAUSE_MS", DEFAULT_DRAIN_MAX_PAUSE_MS),
            },
            sink: SinkConfig {
                tx_timeout_secs: env_or("SINK_TX_TIMEOUT_SECS", DEFAULT_SINK_TX_TIMEOUT_SECS),
            },
            ingest: IngestConfig {
                defer_delay_ms: env_or("INGEST_DEFER_DELAY_MS", DEFAULT_INGEST_DEFER_DELAY_MS),
                defer_max_attempts: env_or(
                    "INGEST_DEFER_MAX_ATTEMPTS",
                    DEFAULT_INGEST_DEFER_MAX_ATTEMPTS,
                ),
            },
            shutdown_timeout_secs: env_or("SHUTDOWN_TIMEOUT_SECS", DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.queue.path.as_os_str().is_empty() {
            anyhow::bail!("QUEUE_PATH cannot be empty");
        }

        if self.queue.report_interval_secs == 0 {
            anyhow::bail!("QUEUE_REPORT_INTERVAL_SECS must be greater than 0");
        }

        if self.drain.base_pause_ms > self.drain.max_pause_ms {
            anyhow::bail!(
                "DRAIN_BASE_PAUSE_MS ({}) cannot exceed DRAIN_MAX_PAUSE_MS ({})",
                self.drain.base_pause_ms,
                self.drain.max_pause_ms
            );
        }

        if self.sink.tx_timeout_secs == 0 {
            anyhow::bail!("SINK_TX_TIMEOUT_SECS must be greater than 0");
        }

        if self.ingest.defer_max_attempts == 0 {
            anyhow::bail!("INGEST_DEFER_MAX_ATTEMPTS must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            queue: QueueConfig {
                path: PathBuf::from(DEFAULT_QUEUE_PATH),
                report_interval_secs: DEFAULT_QUEUE_REPORT_INTERVAL_SECS,
            },
            drain: DrainConfig::default(),
            sink: SinkConfig::default(),
            ingest: IngestConfig::default(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}
