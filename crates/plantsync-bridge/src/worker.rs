//! Drain worker: the per-kind control loop between the retry queue and the
//! sink writer
//!
//! Each iteration leases every item at the lowest pending priority, writes them
//! one at a time, requeues recoverable failures one priority lower and then
//! pauses in proportion to the number of failures. An unrecoverable failure
//! cancels the shared shutdown token, which halts every worker in the process.

use plantsync_common::MessageKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::classify::{classify, Verdict};
use crate::config::DrainConfig;
use crate::queue::{escalate, QueueError, QueueItem, RetryQueue};
use crate::sink::{RecordSink, SinkError, WriteOutcome};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{kind} queue failed: {source}")]
    Queue {
        kind: MessageKind,
        #[source]
        source: QueueError,
    },

    #[error("unrecoverable {kind} write: {source}")]
    Unrecoverable {
        kind: MessageKind,
        #[source]
        source: SinkError,
    },
}

/// Tally of one batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub unchanged: usize,
    pub failures: usize,
    /// Items released untouched because shutdown began mid-batch
    pub released: usize,
}

pub struct DrainWorker {
    kind: MessageKind,
    queue: RetryQueue,
    sink: Arc<dyn RecordSink>,
    config: DrainConfig,
    shutdown: CancellationToken,
}

impl DrainWorker {
    pub fn new(
        kind: MessageKind,
        queue: RetryQueue,
        sink: Arc<dyn RecordSink>,
        config: DrainConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kind,
            queue,
            sink,
            config,
            shutdown,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Drain until shutdown. Any error cancels the shared shutdown token
    /// before returning.
    pub async fn run(self) -> Result<(), WorkerError> {
        tracing::info!(kind = %self.kind, "Drain worker started");

        let result = self.drain().await;

        match &result {
            Ok(()) => tracing::info!(kind = %self.kind, "Drain worker stopped"),
            Err(err) => {
                tracing::error!(kind = %self.kind, error = %err, "Drain worker halted, shutting down");
                self.shutdown.cancel();
            }
        }

        result
    }

    async fn drain(&self) -> Result<(), WorkerError> {
        while !self.shutdown.is_cancelled() {
            if self.queue.is_empty().await.map_err(|e| self.queue_error(e))? {
                self.pause(self.config.poll_interval()).await;
                continue;
            }

            let batch = self
                .queue
                .dequeue_batch()
                .await
                .map_err(|e| self.queue_error(e))?;
            if batch.is_empty() {
                self.pause(self.config.poll_interval()).await;
                continue;
            }

            let report = self.process_batch(batch).await?;
            let pause = self.config.backpressure(report.failures);

            if report.failures > 0 {
                tracing::warn!(
                    kind = %self.kind,
                    failures = report.failures,
                    applied = report.applied,
                    pause_ms = pause.as_millis() as u64,
                    "Batch finished with failures"
                );
            } else {
                tracing::debug!(
                    kind = %self.kind,
                    applied = report.applied,
                    unchanged = report.unchanged,
                    "Batch finished"
                );
            }

            self.pause(pause).await;
        }

        Ok(())
    }

    /// Write every item of a leased batch and settle each one: complete on
    /// success, requeue one priority lower on a recoverable failure.
    ///
    /// On an unrecoverable failure the failing item and everything after it are
    /// released untouched and the error is returned. Once shutdown begins the
    /// remaining items are released the same way.
    pub async fn process_batch(&self, batch: Vec<QueueItem>) -> Result<BatchReport, WorkerError> {
        let mut report = BatchReport::default();
        let mut items = batch.into_iter();

        while let Some(item) = items.next() {
            if self.shutdown.is_cancelled() {
                let rest: Vec<QueueItem> = std::iter::once(item).chain(items).collect();
                self.release(&rest).await?;
                report.released = rest.len();
                break;
            }

            match self.sink.write(self.kind, &item.payload).await {
                Ok(outcome) => {
                    self.queue
                        .complete(&item)
                        .await
                        .map_err(|e| self.queue_error(e))?;
                    match outcome {
                        WriteOutcome::Applied => report.applied += 1,
                        WriteOutcome::Unchanged => report.unchanged += 1,
                    }
                }
                Err(err) => match classify(&err) {
                    Verdict::Recoverable => {
                        let priority = escalate(item.priority);
                        tracing::warn!(
                            kind = %self.kind,
                            item_id = item.id,
                            priority,
                            error = %err,
                            "Recoverable write failure, requeueing"
                        );
                        self.queue
                            .requeue(&item, priority)
                            .await
                            .map_err(|e| self.queue_error(e))?;
                        report.failures += 1;
                    }
                    Verdict::Unrecoverable => {
                        tracing::error!(
                            kind = %self.kind,
                            item_id = item.id,
                            priority = item.priority,
                            error = %err,
                            "Unrecoverable write failure"
                        );
                        let rest: Vec<QueueItem> = std::iter::once(item).chain(items).collect();
                        self.release(&rest).await?;
                        return Err(WorkerError::Unrecoverable {
                            kind: self.kind,
                            source: err,
                        });
                    }
                },
            }
        }

        Ok(report)
    }

    async fn release(&self, items: &[QueueItem]) -> Result<(), WorkerError> {
        self.queue
            .restore(items)
            .await
            .map_err(|e| self.queue_error(e))?;
        tracing::info!(kind = %self.kind, released = items.len(), "Released unprocessed items");
        Ok(())
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    fn queue_error(&self, source: QueueError) -> WorkerError {
        WorkerError::Queue {
            kind: self.kind,
            source,
        }
    }
}
