//! Shared helpers for the PostgreSQL integration tests
//!
//! Every test starts its own container with the migrations applied.
//!
//! ```no_run
//! mod common;
//! use common::TestPostgres;
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn test_with_postgres() {
//!     let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
//!     sqlx::query("SELECT 1").execute(pg.pool()).await.expect("Query failed");
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use plantsync_bridge::catalog::PgCatalog;
use plantsync_bridge::config::SinkConfig;
use plantsync_bridge::messages::{QueuedRecord, ResolvedRecord};
use plantsync_bridge::sink::PgSinkWriter;
use plantsync_common::AssetIdentity;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// PostgreSQL container with the bridge schema applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        plantsync_bridge::db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn catalog(&self) -> Arc<PgCatalog> {
        Arc::new(PgCatalog::new(self.pool.clone()))
    }

    pub fn sink(&self) -> PgSinkWriter {
        PgSinkWriter::new(self.pool.clone(), self.catalog(), SinkConfig::default())
    }
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,plantsync_bridge=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

pub fn press() -> AssetIdentity {
    AssetIdentity::new("acme", "plant-1", "press-7")
}

/// Queue payload for a record whose keys the sink resolves
pub fn queued<M: Serialize>(asset: AssetIdentity, message: M) -> Vec<u8> {
    serde_json::to_vec(&QueuedRecord { asset, message }).expect("serializable record")
}

/// Queue payload for a record resolved at ingest
pub fn resolved<M: Serialize>(asset_id: i32, asset: AssetIdentity, message: M) -> Vec<u8> {
    serde_json::to_vec(&ResolvedRecord {
        asset_id,
        asset,
        message,
    })
    .expect("serializable record")
}

pub fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// `(status, start_time, end_time)` of a work order
pub async fn work_order_state(
    pool: &PgPool,
    external_id: &str,
) -> (i16, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    sqlx::query_as(
        "SELECT status, start_time, end_time FROM work_orders WHERE external_work_order_id = $1",
    )
    .bind(external_id)
    .fetch_one(pool)
    .await
    .expect("work order exists")
}

pub async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count query")
}
