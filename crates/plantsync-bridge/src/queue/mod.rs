//! Durable, priority-ordered local retry queue
//!
//! Every message kind owns one namespace in a single process-local SQLite
//! file. Lower priority values are more urgent; fresh items enter at 0 and each
//! failed attempt demotes the item by one, capped at [`MAX_RETRY_PRIORITY`].
//!
//! Items move through two states:
//! - **pending**: visible to [`RetryQueue::dequeue_batch`] and counted by
//!   [`RetryQueue::len`]
//! - **leased**: handed to a drain worker and invisible until the worker
//!   completes, requeues or restores them
//!
//! A lease never outlives the process: opening the store returns every leased
//! item to pending, so an item leaves storage only after an explicit
//! success-or-requeue decision.

mod store;

pub use store::{QueueStore, RetryQueue};

use thiserror::Error;

/// Priority of a freshly ingested item
pub const FRESH_PRIORITY: u8 = 0;

/// Highest priority value a retried item can reach
pub const MAX_RETRY_PRIORITY: u8 = 254;

/// Namespace holding raw messages whose identity could not be resolved
pub const FALLBACK_NAMESPACE: &str = "fallback";

/// Priority after one more failed attempt: `min(priority + 1, 254)`.
pub fn escalate(priority: u8) -> u8 {
    priority.saturating_add(1).min(MAX_RETRY_PRIORITY)
}

/// An item owned by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Monotonic insertion id, FIFO tie-break within a priority
    pub id: i64,
    pub priority: u8,
    pub payload: Vec<u8>,
}

/// Durable storage failure. Always fatal to the owning process.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("failed to prepare queue location {path}: {source}")]
    Setup {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt queue item {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate_demotes_by_one() {
        assert_eq!(escalate(0), 1);
        assert_eq!(escalate(17), 18);
        assert_eq!(escalate(253), 254);
    }

    #[test]
    fn test_escalate_caps_below_maximum() {
        assert_eq!(escalate(254), 254);
        assert_eq!(escalate(255), 254);
    }

    #[test]
    fn test_repeated_escalation_matches_closed_form() {
        for initial in [0u8, 5, 200, 254] {
            let mut priority = initial;
            for k in 1..=300u32 {
                priority = escalate(priority);
                let expected = (u32::from(initial) + k).min(254);
                assert_eq!(u32::from(priority), expected);
            }
        }
    }
}
