//! Bridge supervisor: owns the queue store, the database pool and every
//! background task
//!
//! One drain worker runs per message kind, next to the deferred retry
//! scheduler and the queue length reporter. All of them share a single
//! cancellation token; a worker or scheduler that fails cancels it, which
//! stops the rest.

use plantsync_common::MessageKind;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CatalogResolver, PgCatalog};
use crate::config::Config;
use crate::db::{self, DbError};
use crate::ingest::{IngestAdapter, IngestError};
use crate::queue::{QueueError, QueueStore, RetryQueue, FALLBACK_NAMESPACE};
use crate::sink::{PgSinkWriter, RecordSink};
use crate::worker::{DrainWorker, WorkerError};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("background task panicked: {0}")]
    Join(#[from] JoinError),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

pub struct Bridge {
    store: QueueStore,
    pool: Option<PgPool>,
    ingest: Arc<IngestAdapter>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<Result<(), WorkerError>>>,
    scheduler: JoinHandle<Result<(), IngestError>>,
    reporter: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl Bridge {
    /// Open the queue, connect and migrate the database, start every task and
    /// replay parked messages.
    pub async fn start(config: &Config) -> BridgeResult<Self> {
        let store = QueueStore::open(&config.queue.path).await?;

        let pool = db::create_pool(&config.database).await?;
        db::run_migrations(&pool).await?;

        let catalog: Arc<dyn CatalogResolver> = Arc::new(PgCatalog::new(pool.clone()));
        let sink = Arc::new(PgSinkWriter::new(pool.clone(), catalog.clone(), config.sink));

        let mut bridge = Self::with_components(store, sink, catalog, config).await?;
        bridge.pool = Some(pool);
        Ok(bridge)
    }

    /// Start the bridge around an already opened store and an arbitrary sink.
    pub async fn with_components(
        store: QueueStore,
        sink: Arc<dyn RecordSink>,
        catalog: Arc<dyn CatalogResolver>,
        config: &Config,
    ) -> BridgeResult<Self> {
        let shutdown = CancellationToken::new();

        let workers = MessageKind::ALL
            .iter()
            .map(|kind| {
                let worker = DrainWorker::new(
                    *kind,
                    store.queue(kind.namespace()),
                    sink.clone(),
                    config.drain,
                    shutdown.clone(),
                );
                tracing::debug!(kind = %worker.kind(), "Spawning drain worker");
                tokio::spawn(worker.run())
            })
            .collect();

        let (ingest, scheduler) =
            IngestAdapter::new(&store, catalog, config.ingest, shutdown.clone());
        let scheduler = tokio::spawn(scheduler.run());

        let mut reported: Vec<RetryQueue> = MessageKind::ALL
            .iter()
            .map(|kind| store.queue(kind.namespace()))
            .collect();
        reported.push(store.queue(FALLBACK_NAMESPACE));
        let reporter = tokio::spawn(report_queue_lengths(
            reported,
            Duration::from_secs(config.queue.report_interval_secs),
            shutdown.clone(),
        ));

        let bridge = Self {
            store,
            pool: None,
            ingest,
            shutdown,
            workers,
            scheduler,
            reporter,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        };

        let replayed = match bridge.ingest.replay_fallback().await {
            Ok(replayed) => replayed,
            Err(err) => {
                bridge.shutdown.cancel();
                return Err(err.into());
            }
        };

        tracing::info!(
            workers = MessageKind::ALL.len(),
            replayed,
            "Bridge started"
        );

        Ok(bridge)
    }

    pub fn ingest(&self) -> &Arc<IngestAdapter> {
        &self.ingest
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves once shutdown has been requested or a worker halted.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stop every task, then close the queue store and the pool.
    ///
    /// Returns the first worker or scheduler error, so a halt caused by an
    /// unrecoverable write surfaces here.
    pub async fn shutdown(self) -> BridgeResult<()> {
        tracing::info!("Shutting down bridge");
        self.shutdown.cancel();

        let Self {
            store,
            pool,
            workers,
            scheduler,
            reporter,
            shutdown_timeout,
            ..
        } = self;

        let joined = tokio::time::timeout(shutdown_timeout, async {
            let mut first_error: Option<BridgeError> = None;

            for handle in workers {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        first_error.get_or_insert(err.into());
                    }
                    Err(err) => {
                        first_error.get_or_insert(err.into());
                    }
                }
            }

            match scheduler.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    first_error.get_or_insert(err.into());
                }
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }

            if let Err(err) = reporter.await {
                first_error.get_or_insert(err.into());
            }

            first_error
        })
        .await;

        store.close().await;
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!("Database pool closed");
        }

        match joined {
            Ok(None) => {
                tracing::info!("Bridge stopped");
                Ok(())
            }
            Ok(Some(err)) => Err(err),
            Err(_) => {
                tracing::error!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Bridge tasks did not stop in time"
                );
                Err(BridgeError::ShutdownTimeout(shutdown_timeout))
            }
        }
    }
}

async fn report_queue_lengths(
    queues: Vec<RetryQueue>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for queue in &queues {
                    match queue.len().await {
                        Ok(len) => tracing::info!(namespace = queue.namespace(), len, "Queue length"),
                        Err(err) => tracing::warn!(
                            namespace = queue.namespace(),
                            error = %err,
                            "Failed to read queue length"
                        ),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::CatalogResult;
    use crate::config::DrainConfig;
    use crate::messages::RawMessage;
    use crate::sink::{SinkError, SinkResult, WriteOutcome};
    use async_trait::async_trait;
    use plantsync_common::AssetIdentity;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        writes: Mutex<Vec<MessageKind>>,
        poison: Option<MessageKind>,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        async fn write(&self, kind: MessageKind, _payload: &[u8]) -> SinkResult<WriteOutcome> {
            if self.poison == Some(kind) {
                return Err(SinkError::Database(sqlx::Error::ColumnNotFound(
                    "missing".to_string(),
                )));
            }
            self.writes.lock().unwrap().push(kind);
            Ok(WriteOutcome::Applied)
        }
    }

    struct NoAssets;

    #[async_trait]
    impl CatalogResolver for NoAssets {
        async fn get_or_insert_asset(&self, _identity: &AssetIdentity) -> CatalogResult<i32> {
            Ok(1)
        }

        async fn get_or_insert_product_type(
            &self,
            _asset_id: i32,
            _external_product_id: &str,
            _cycle_time_ms: i64,
        ) -> CatalogResult<i32> {
            Ok(1)
        }

        async fn find_asset(&self, _identity: &AssetIdentity) -> CatalogResult<Option<i32>> {
            Ok(None)
        }
    }

    fn test_config(queue_path: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.queue.path = queue_path.to_path_buf();
        config.drain = DrainConfig {
            poll_interval_ms: 1,
            base_pause_ms: 1,
            pause_per_failure_ms: 1,
            max_pause_ms: 5,
        };
        config.ingest.defer_delay_ms = 60_000;
        config.shutdown_timeout_secs = 10;
        config
    }

    fn shift_add() -> RawMessage {
        RawMessage::new(
            MessageKind::ShiftAdd,
            AssetIdentity::new("acme", "plant-1", "press-7"),
            serde_json::to_vec(&json!({"startTimeUnixMs": 1000, "endTimeUnixMs": 2000})).unwrap(),
        )
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_submitted_messages_reach_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("queue.db"));
        let store = QueueStore::open(&config.queue.path).await.unwrap();
        let sink = Arc::new(RecordingSink::default());

        let bridge = Bridge::with_components(store, sink.clone(), Arc::new(NoAssets), &config)
            .await
            .unwrap();
        bridge.ingest().submit(shift_add()).await.unwrap();

        wait_until(|| sink.writes.lock().unwrap().len() == 1).await;
        bridge.shutdown().await.unwrap();

        assert_eq!(*sink.writes.lock().unwrap(), vec![MessageKind::ShiftAdd]);
    }

    #[tokio::test]
    async fn test_unrecoverable_write_stops_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("queue.db"));
        let store = QueueStore::open(&config.queue.path).await.unwrap();
        let sink = Arc::new(RecordingSink {
            poison: Some(MessageKind::ShiftAdd),
            ..Default::default()
        });

        let bridge = Bridge::with_components(store, sink, Arc::new(NoAssets), &config)
            .await
            .unwrap();
        bridge.ingest().submit(shift_add()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), bridge.stopped())
            .await
            .unwrap();
        let err = bridge.shutdown().await.unwrap_err();
        assert!(matches!(err, BridgeError::Worker(WorkerError::Unrecoverable { .. })));

        // the failed record stays queued for the next start
        let store = QueueStore::open(&config.queue.path).await.unwrap();
        assert_eq!(store.queue("shift_add").len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deferred_messages_survive_restart_via_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir.path().join("queue.db"));
        let scrap = RawMessage::new(
            MessageKind::ScrapUniqueProduct,
            AssetIdentity::new("acme", "plant-1", "press-7"),
            serde_json::to_vec(&json!({"UID": "u-1"})).unwrap(),
        );

        let store = QueueStore::open(&config.queue.path).await.unwrap();
        let bridge = Bridge::with_components(
            store,
            Arc::new(RecordingSink::default()),
            Arc::new(NoAssets),
            &config,
        )
        .await
        .unwrap();
        bridge.ingest().submit(scrap).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.shutdown().await.unwrap();

        let store = QueueStore::open(&config.queue.path).await.unwrap();
        assert_eq!(store.queue(FALLBACK_NAMESPACE).len().await.unwrap(), 1);
        store.close().await;

        // still unresolvable: replay defers it again, shutdown parks it again
        let store = QueueStore::open(&config.queue.path).await.unwrap();
        let bridge = Bridge::with_components(
            store,
            Arc::new(RecordingSink::default()),
            Arc::new(NoAssets),
            &config,
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.shutdown().await.unwrap();

        let store = QueueStore::open(&config.queue.path).await.unwrap();
        assert_eq!(store.queue(FALLBACK_NAMESPACE).len().await.unwrap(), 1);
    }
}
