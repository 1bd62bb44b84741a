//! Delayed resubmission of messages whose identity is not resolvable yet

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use super::{Deferred, IngestAdapter, IngestResult};
use crate::messages::RawMessage;

/// Owns every pending deferral. Due entries are handed back to the adapter;
/// on shutdown everything still waiting is parked in the fallback namespace.
pub struct DeferredScheduler {
    adapter: Arc<IngestAdapter>,
    incoming: mpsc::UnboundedReceiver<Deferred>,
    delay: Duration,
    shutdown: CancellationToken,
}

impl DeferredScheduler {
    pub(super) fn new(
        adapter: Arc<IngestAdapter>,
        incoming: mpsc::UnboundedReceiver<Deferred>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            incoming,
            delay,
            shutdown,
        }
    }

    /// Resubmit due entries until shutdown.
    ///
    /// A queue failure while resubmitting is fatal: the shared shutdown token
    /// is cancelled and every entry still held here is parked before the error
    /// is returned.
    pub async fn run(mut self) -> IngestResult<()> {
        let mut timers: DelayQueue<u64> = DelayQueue::new();
        let mut waiting: HashMap<u64, Deferred> = HashMap::new();
        let mut next_id = 0u64;

        let failure = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                Some(deferred) = self.incoming.recv() => {
                    waiting.insert(next_id, deferred);
                    timers.insert(next_id, self.delay);
                    next_id += 1;
                }
                Some(expired) = timers.next(), if !timers.is_empty() => {
                    let Some(Deferred { raw, attempt }) = waiting.remove(expired.get_ref()) else {
                        continue;
                    };
                    if let Err(err) = self.adapter.process(raw.clone(), attempt).await {
                        break Some((raw, err));
                    }
                }
            }
        };

        let mut pending: Vec<RawMessage> = Vec::new();
        let (reason, mut error) = match failure {
            Some((raw, err)) => {
                tracing::error!(
                    kind = %raw.kind,
                    asset = %raw.asset,
                    error = %err,
                    "Deferred retry failed, shutting down"
                );
                self.shutdown.cancel();
                pending.push(raw);
                ("retry scheduler failed", Some(err))
            }
            None => ("shutdown in progress", None),
        };

        // refuse further deferrals; senders now park directly
        self.incoming.close();
        timers.clear();
        while let Some(deferred) = self.incoming.recv().await {
            pending.push(deferred.raw);
        }
        pending.extend(waiting.into_values().map(|deferred| deferred.raw));

        let mut parked = 0usize;
        for raw in &pending {
            match self.adapter.park(raw, reason).await {
                Ok(_) => parked += 1,
                Err(err) => {
                    tracing::error!(
                        kind = %raw.kind,
                        asset = %raw.asset,
                        error = %err,
                        "Failed to park deferred message"
                    );
                    error.get_or_insert(err);
                }
            }
        }

        tracing::info!(
            parked,
            unparked = pending.len() - parked,
            "Deferred retry scheduler stopped"
        );

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
