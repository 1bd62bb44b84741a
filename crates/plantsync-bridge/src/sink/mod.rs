//! Sink writer: applies one queued record to the relational store
//!
//! Every record is written with exactly one statement inside a transaction
//! bounded by a fixed ceiling. Dimension keys are resolved through the catalog
//! before the transaction opens, so resolver round-trips never extend the time
//! row locks are held.
//!
//! Statements follow one of three patterns:
//! - idempotent create (`INSERT ... ON CONFLICT ... DO NOTHING`)
//! - idempotent delete keyed by the natural composite key
//! - guarded state transition (`UPDATE ... WHERE <expected state>`)
//!
//! A statement that matches nothing is still a success. It is reported as
//! [`WriteOutcome::Unchanged`] so the caller can tell a no-op from a change.

mod scrap;
mod shift;
mod work_order;

use async_trait::async_trait;
use plantsync_common::MessageKind;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::Postgres;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{CatalogError, CatalogResolver};
use crate::config::SinkConfig;
use crate::messages::ValidationError;

/// Failure to apply a record. Classified by [`crate::classify`].
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transaction exceeded its {0:?} ceiling")]
    Timeout(Duration),

    #[error("failed to decode queued {kind} record: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("queued record is invalid: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Effect of a successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The statement changed a row
    Applied,
    /// The statement matched nothing: duplicate create, absent delete target or
    /// a guard that no longer holds
    Unchanged,
}

impl WriteOutcome {
    pub fn from_rows_affected(rows: u64) -> Self {
        if rows == 0 {
            WriteOutcome::Unchanged
        } else {
            WriteOutcome::Applied
        }
    }
}

/// Destination of drained records
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, kind: MessageKind, payload: &[u8]) -> SinkResult<WriteOutcome>;
}

type Statement<'q> = Query<'q, Postgres, PgArguments>;

/// [`RecordSink`] over PostgreSQL
pub struct PgSinkWriter {
    pool: PgPool,
    catalog: Arc<dyn CatalogResolver>,
    tx_timeout: Duration,
}

impl PgSinkWriter {
    pub fn new(pool: PgPool, catalog: Arc<dyn CatalogResolver>, config: SinkConfig) -> Self {
        Self {
            pool,
            catalog,
            tx_timeout: config.tx_timeout(),
        }
    }

    pub(crate) fn catalog(&self) -> &dyn CatalogResolver {
        self.catalog.as_ref()
    }

    /// Run a single statement in its own transaction, bounded by the ceiling.
    /// Returns the number of affected rows.
    async fn execute(&self, statement: Statement<'_>) -> SinkResult<u64> {
        match tokio::time::timeout(self.tx_timeout, self.execute_unbounded(statement)).await {
            Ok(result) => result,
            Err(_) => {
                // the dropped transaction is rolled back when its connection
                // returns to the pool
                tracing::warn!(
                    timeout_secs = self.tx_timeout.as_secs(),
                    "Sink transaction exceeded ceiling, aborting"
                );
                Err(SinkError::Timeout(self.tx_timeout))
            }
        }
    }

    async fn execute_unbounded(&self, statement: Statement<'_>) -> SinkResult<u64> {
        let mut tx = self.pool.begin().await?;

        match statement.execute(&mut *tx).await {
            Ok(done) => {
                tx.commit().await?;
                Ok(done.rows_affected())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(
                        error = %rollback_err,
                        statement_error = %err,
                        "Rollback failed"
                    );
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl RecordSink for PgSinkWriter {
    async fn write(&self, kind: MessageKind, payload: &[u8]) -> SinkResult<WriteOutcome> {
        let outcome = match kind {
            MessageKind::ShiftAdd => shift::add(self, payload).await?,
            MessageKind::ShiftDelete => shift::delete(self, payload).await?,
            MessageKind::WorkOrderCreate => work_order::create(self, payload).await?,
            MessageKind::WorkOrderStart => work_order::start(self, payload).await?,
            MessageKind::WorkOrderStop => work_order::stop(self, payload).await?,
            MessageKind::ScrapUniqueProduct => scrap::mark_scrapped(self, payload).await?,
        };

        tracing::debug!(kind = %kind, outcome = ?outcome, "Record written");
        Ok(outcome)
    }
}

fn decode_record<R: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> SinkResult<R> {
    serde_json::from_slice(payload).map_err(|source| SinkError::Decode { kind, source })
}
