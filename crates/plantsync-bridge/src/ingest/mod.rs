//! Ingest adapter: validates broker messages and hands them to the retry queue
//!
//! Messages that fail validation are logged and dropped. Kinds that need a
//! dimension key which does not exist yet are deferred: the
//! [`DeferredScheduler`] resubmits them after a delay, and anything still
//! unresolved after the attempt limit or at shutdown is parked in the durable
//! fallback namespace, which is replayed on the next start.

mod deferred;

pub use deferred::DeferredScheduler;

use plantsync_common::MessageKind;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogResolver;
use crate::config::IngestConfig;
use crate::messages::{InboundMessage, QueuedRecord, RawMessage, ResolvedRecord, ValidationError};
use crate::queue::{QueueError, QueueStore, RetryQueue, FALLBACK_NAMESPACE, FRESH_PRIORITY};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to encode queued record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("ingest is shutting down")]
    ShuttingDown,
}

pub type IngestResult<T> = Result<T, IngestError>;

/// What happened to a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Persisted in the kind's retry queue
    Enqueued,
    /// Waiting for its identity to resolve
    Deferred,
    /// Parked in the fallback namespace
    Parked,
    /// Failed validation and was discarded
    Dropped,
}

/// A message waiting for a retry
#[derive(Debug)]
pub(crate) struct Deferred {
    pub raw: RawMessage,
    pub attempt: u32,
}

pub struct IngestAdapter {
    queues: HashMap<MessageKind, RetryQueue>,
    fallback: RetryQueue,
    catalog: Arc<dyn CatalogResolver>,
    config: IngestConfig,
    deferrals: mpsc::UnboundedSender<Deferred>,
    shutdown: CancellationToken,
}

impl IngestAdapter {
    /// Build the adapter and the scheduler that owns its deferred retries.
    /// The scheduler must be run for deferrals to make progress.
    pub fn new(
        store: &QueueStore,
        catalog: Arc<dyn CatalogResolver>,
        config: IngestConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, DeferredScheduler) {
        let queues = MessageKind::ALL
            .iter()
            .map(|kind| (*kind, store.queue(kind.namespace())))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();

        let adapter = Arc::new(Self {
            queues,
            fallback: store.queue(FALLBACK_NAMESPACE),
            catalog,
            config,
            deferrals: tx,
            shutdown: shutdown.clone(),
        });

        let scheduler = DeferredScheduler::new(adapter.clone(), rx, config.defer_delay(), shutdown);
        (adapter, scheduler)
    }

    /// Accept one broker message.
    pub async fn submit(&self, raw: RawMessage) -> IngestResult<Submission> {
        if self.shutdown.is_cancelled() {
            return Err(IngestError::ShuttingDown);
        }
        self.process(raw, 0).await
    }

    /// Re-submit every message parked in the fallback namespace.
    pub async fn replay_fallback(&self) -> IngestResult<usize> {
        // parked items all share the fresh priority, so one batch holds them all
        let parked = self.fallback.dequeue_batch().await?;
        if parked.is_empty() {
            return Ok(0);
        }

        tracing::info!(count = parked.len(), "Replaying parked messages");

        let mut replayed = 0;
        for (index, item) in parked.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                self.fallback.restore(&parked[index..]).await?;
                break;
            }

            match serde_json::from_slice::<RawMessage>(&item.payload) {
                Ok(raw) => {
                    if let Err(err) = self.process(raw, 0).await {
                        self.fallback.restore(&parked[index..]).await?;
                        return Err(err);
                    }
                    replayed += 1;
                }
                Err(err) => {
                    tracing::warn!(item_id = item.id, error = %err, "Discarding undecodable parked message");
                }
            }
            self.fallback.complete(item).await?;
        }

        Ok(replayed)
    }

    /// Validate, resolve and enqueue; `attempt` counts earlier deferrals.
    pub(crate) async fn process(&self, raw: RawMessage, attempt: u32) -> IngestResult<Submission> {
        let message = match validate(&raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    kind = %raw.kind,
                    asset = %raw.asset,
                    error = %err,
                    "Dropping invalid message"
                );
                return Ok(Submission::Dropped);
            }
        };

        let record = match self.encode_record(&raw, message).await? {
            Some(record) => record,
            None => return self.defer(raw, attempt).await,
        };

        let queue = self
            .queues
            .get(&raw.kind)
            .unwrap_or(&self.fallback);
        queue.enqueue(&record, FRESH_PRIORITY).await?;

        tracing::debug!(kind = %raw.kind, asset = %raw.asset, "Message enqueued");
        Ok(Submission::Enqueued)
    }

    /// Serialize the queued record. `None` when a required dimension key is
    /// not resolvable yet.
    async fn encode_record(
        &self,
        raw: &RawMessage,
        message: InboundMessage,
    ) -> IngestResult<Option<Vec<u8>>> {
        let asset = raw.asset.clone();
        let bytes = match message {
            InboundMessage::ScrapUniqueProduct(message) => {
                let asset_id = match self.catalog.find_asset(&asset).await {
                    Ok(Some(id)) => id,
                    Ok(None) => return Ok(None),
                    Err(err) => {
                        tracing::warn!(asset = %asset, error = %err, "Asset lookup failed, deferring");
                        return Ok(None);
                    }
                };
                serde_json::to_vec(&ResolvedRecord {
                    asset_id,
                    asset,
                    message,
                })?
            }
            InboundMessage::ShiftAdd(message) => serde_json::to_vec(&QueuedRecord { asset, message })?,
            InboundMessage::ShiftDelete(message) => {
                serde_json::to_vec(&QueuedRecord { asset, message })?
            }
            InboundMessage::WorkOrderCreate(message) => {
                serde_json::to_vec(&QueuedRecord { asset, message })?
            }
            InboundMessage::WorkOrderStart(message) => {
                serde_json::to_vec(&QueuedRecord { asset, message })?
            }
            InboundMessage::WorkOrderStop(message) => {
                serde_json::to_vec(&QueuedRecord { asset, message })?
            }
        };
        Ok(Some(bytes))
    }

    async fn defer(&self, raw: RawMessage, attempt: u32) -> IngestResult<Submission> {
        if self.shutdown.is_cancelled() {
            return self.park(&raw, "shutdown in progress").await;
        }

        let attempt = attempt + 1;
        if attempt > self.config.defer_max_attempts {
            return self.park(&raw, "retry attempts exhausted").await;
        }

        tracing::debug!(kind = %raw.kind, asset = %raw.asset, attempt, "Identity not resolvable yet, deferring");

        match self.deferrals.send(Deferred { raw, attempt }) {
            Ok(()) => Ok(Submission::Deferred),
            // scheduler already stopped
            Err(mpsc::error::SendError(deferred)) => {
                self.park(&deferred.raw, "retry scheduler stopped").await
            }
        }
    }

    /// Persist a raw message in the fallback namespace.
    pub(crate) async fn park(&self, raw: &RawMessage, reason: &str) -> IngestResult<Submission> {
        let payload = serde_json::to_vec(raw)?;
        self.fallback.enqueue(&payload, FRESH_PRIORITY).await?;
        tracing::warn!(kind = %raw.kind, asset = %raw.asset, reason, "Message parked in fallback queue");
        Ok(Submission::Parked)
    }
}

fn validate(raw: &RawMessage) -> Result<InboundMessage, ValidationError> {
    if !raw.asset.is_complete() {
        return Err(ValidationError::Identity(raw.asset.clone()));
    }
    InboundMessage::decode(raw.kind, &raw.payload)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::CatalogResult;
    use crate::messages::{ScrapUniqueProduct, ShiftAdd};
    use async_trait::async_trait;
    use plantsync_common::AssetIdentity;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    /// Resolver knowing only the assets it was told about
    #[derive(Default)]
    struct KnownAssets {
        ids: RwLock<HashMap<AssetIdentity, i32>>,
    }

    impl KnownAssets {
        async fn learn(&self, identity: AssetIdentity, id: i32) {
            self.ids.write().await.insert(identity, id);
        }
    }

    #[async_trait]
    impl CatalogResolver for KnownAssets {
        async fn get_or_insert_asset(&self, identity: &AssetIdentity) -> CatalogResult<i32> {
            Ok(self.find_asset(identity).await?.unwrap_or(1))
        }

        async fn get_or_insert_product_type(
            &self,
            _asset_id: i32,
            _external_product_id: &str,
            _cycle_time_ms: i64,
        ) -> CatalogResult<i32> {
            Ok(1)
        }

        async fn find_asset(&self, identity: &AssetIdentity) -> CatalogResult<Option<i32>> {
            Ok(self.ids.read().await.get(identity).copied())
        }
    }

    struct Harness {
        _dir: TempDir,
        store: QueueStore,
        catalog: Arc<KnownAssets>,
        token: CancellationToken,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = QueueStore::open(&dir.path().join("queue.db")).await.unwrap();
            Self {
                _dir: dir,
                store,
                catalog: Arc::new(KnownAssets::default()),
                token: CancellationToken::new(),
            }
        }

        fn adapter(&self, max_attempts: u32) -> (Arc<IngestAdapter>, DeferredScheduler) {
            IngestAdapter::new(
                &self.store,
                self.catalog.clone(),
                IngestConfig {
                    defer_delay_ms: 5,
                    defer_max_attempts: max_attempts,
                },
                self.token.clone(),
            )
        }
    }

    fn press() -> AssetIdentity {
        AssetIdentity::new("acme", "plant-1", "press-7")
    }

    fn raw(kind: MessageKind, payload: serde_json::Value) -> RawMessage {
        RawMessage::new(kind, press(), serde_json::to_vec(&payload).unwrap())
    }

    fn scrap() -> RawMessage {
        raw(MessageKind::ScrapUniqueProduct, json!({"UID": "u-1"}))
    }

    async fn wait_for_len(queue: &RetryQueue, expected: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while queue.len().await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_valid_message_is_enqueued_at_fresh_priority() {
        let h = Harness::new().await;
        let (adapter, _scheduler) = h.adapter(3);

        let outcome = adapter
            .submit(raw(
                MessageKind::ShiftAdd,
                json!({"startTimeUnixMs": 1000, "endTimeUnixMs": 2000}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, Submission::Enqueued);

        let batch = h.store.queue("shift_add").dequeue_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].priority, FRESH_PRIORITY);
        let record: QueuedRecord<ShiftAdd> = serde_json::from_slice(&batch[0].payload).unwrap();
        assert_eq!(record.asset, press());
        assert_eq!(record.message.end_time_unix_ms, 2000);
    }

    #[tokio::test]
    async fn test_invalid_messages_are_dropped() {
        let h = Harness::new().await;
        let (adapter, _scheduler) = h.adapter(3);

        let bad_payload = raw(MessageKind::ShiftDelete, json!({"startTimeUnixMs": "soon"}));
        assert_eq!(adapter.submit(bad_payload).await.unwrap(), Submission::Dropped);

        let mut no_identity = raw(MessageKind::ShiftDelete, json!({"startTimeUnixMs": 1000}));
        no_identity.asset.equipment = String::new();
        assert_eq!(adapter.submit(no_identity).await.unwrap(), Submission::Dropped);

        assert!(h.store.queue("shift_delete").is_empty().await.unwrap());
        assert!(h.store.queue(FALLBACK_NAMESPACE).is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_scrap_for_known_asset_carries_resolved_id() {
        let h = Harness::new().await;
        h.catalog.learn(press(), 42).await;
        let (adapter, _scheduler) = h.adapter(3);

        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Enqueued);

        let batch = h.store.queue("scrap_unique_product").dequeue_batch().await.unwrap();
        let record: ResolvedRecord<ScrapUniqueProduct> =
            serde_json::from_slice(&batch[0].payload).unwrap();
        assert_eq!(record.asset_id, 42);
        assert_eq!(record.message.uid, "u-1");
    }

    #[tokio::test]
    async fn test_deferred_scrap_is_enqueued_once_asset_appears() {
        let h = Harness::new().await;
        let (adapter, scheduler) = h.adapter(1000);
        let scheduler = tokio::spawn(scheduler.run());

        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Deferred);
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.catalog.learn(press(), 7).await;

        wait_for_len(&h.store.queue("scrap_unique_product"), 1).await;
        assert!(h.store.queue(FALLBACK_NAMESPACE).is_empty().await.unwrap());

        h.token.cancel();
        scheduler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_deferral_is_parked() {
        let h = Harness::new().await;
        let (adapter, scheduler) = h.adapter(2);
        let scheduler = tokio::spawn(scheduler.run());

        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Deferred);

        let fallback = h.store.queue(FALLBACK_NAMESPACE);
        wait_for_len(&fallback, 1).await;
        let parked = fallback.dequeue_batch().await.unwrap();
        let raw_back: RawMessage = serde_json::from_slice(&parked[0].payload).unwrap();
        assert_eq!(raw_back, scrap());

        h.token.cancel();
        scheduler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_parks_pending_deferrals() {
        let h = Harness::new().await;
        let (adapter, scheduler) = IngestAdapter::new(
            &h.store,
            h.catalog.clone(),
            IngestConfig {
                defer_delay_ms: 60_000,
                defer_max_attempts: 3,
            },
            h.token.clone(),
        );
        let scheduler = tokio::spawn(scheduler.run());

        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Deferred);
        // let the scheduler pick it up
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.token.cancel();
        scheduler.await.unwrap().unwrap();

        assert_eq!(h.store.queue(FALLBACK_NAMESPACE).len().await.unwrap(), 1);
        assert!(matches!(adapter.submit(scrap()).await, Err(IngestError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_queue_failure_stops_scheduler_and_cancels_shutdown() {
        let h = Harness::new().await;
        let (adapter, scheduler) = IngestAdapter::new(
            &h.store,
            h.catalog.clone(),
            IngestConfig {
                defer_delay_ms: 50,
                defer_max_attempts: 1000,
            },
            h.token.clone(),
        );
        let scheduler = tokio::spawn(scheduler.run());

        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Deferred);
        assert_eq!(adapter.submit(scrap()).await.unwrap(), Submission::Deferred);

        // the next resubmission resolves but cannot be persisted
        h.store.close().await;
        h.catalog.learn(press(), 7).await;

        let result = tokio::time::timeout(Duration::from_secs(10), scheduler)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(IngestError::Queue(_))));
        assert!(h.token.is_cancelled());
        assert!(matches!(adapter.submit(scrap()).await, Err(IngestError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_replay_resubmits_parked_messages() {
        let h = Harness::new().await;
        let (adapter, _scheduler) = h.adapter(3);

        let shift = raw(
            MessageKind::ShiftAdd,
            json!({"startTimeUnixMs": 1000, "endTimeUnixMs": 2000}),
        );
        assert_eq!(adapter.park(&shift, "test").await.unwrap(), Submission::Parked);
        h.store
            .queue(FALLBACK_NAMESPACE)
            .enqueue(b"not a raw message", FRESH_PRIORITY)
            .await
            .unwrap();

        assert_eq!(adapter.replay_fallback().await.unwrap(), 1);
        assert_eq!(h.store.queue("shift_add").len().await.unwrap(), 1);
        assert!(h.store.queue(FALLBACK_NAMESPACE).is_empty().await.unwrap());
        assert_eq!(h.store.queue(FALLBACK_NAMESPACE).in_flight().await.unwrap(), 0);
    }
}
