//! Error classifier: decides whether a failed write is retried or halts the
//! process.
//!
//! The verdict depends only on the error itself. Retry history lives in queue
//! priority, never here.

use crate::catalog::CatalogError;
use crate::sink::SinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Transient; the same statement is expected to succeed later
    Recoverable,
    /// The statement is permanently wrong for this record
    Unrecoverable,
}

impl Verdict {
    pub fn is_recoverable(self) -> bool {
        self == Verdict::Recoverable
    }
}

pub fn classify(error: &SinkError) -> Verdict {
    match error {
        SinkError::Database(err) => classify_sqlx(err),
        SinkError::Catalog(CatalogError::Database(err)) => classify_sqlx(err),
        SinkError::Timeout(_) => Verdict::Recoverable,
        SinkError::Decode { .. } | SinkError::Invalid(_) => Verdict::Unrecoverable,
    }
}

fn classify_sqlx(error: &sqlx::Error) -> Verdict {
    match error {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => classify_sqlstate(&code),
            None => Verdict::Recoverable,
        },

        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Verdict::Recoverable,

        // catalog insert-then-select can race a concurrent writer
        sqlx::Error::RowNotFound => Verdict::Recoverable,

        sqlx::Error::Configuration(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Encode(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Migrate(_) => Verdict::Unrecoverable,

        _ => Verdict::Recoverable,
    }
}

/// PostgreSQL SQLSTATE codes. Classes not listed as permanent are retried.
fn classify_sqlstate(code: &str) -> Verdict {
    match code {
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => Verdict::Recoverable,
        // lock_not_available, query_canceled
        "55P03" | "57014" => Verdict::Recoverable,
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01" | "57P02" | "57P03" => Verdict::Recoverable,
        _ => match code.get(..2) {
            // connection exception, insufficient resources, system error
            Some("08") | Some("53") | Some("58") => Verdict::Recoverable,
            // integrity violation, data exception, syntax/access rule,
            // feature not supported, invalid transaction state
            Some("23") | Some("22") | Some("42") | Some("0A") | Some("25") => {
                Verdict::Unrecoverable
            }
            _ => Verdict::Recoverable,
        },
    }
}
