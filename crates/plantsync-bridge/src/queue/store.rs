//! SQLite-backed queue store

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

use super::{QueueError, QueueItem, QueueResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        namespace TEXT    NOT NULL,
        priority  INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 255),
        payload   BLOB    NOT NULL,
        leased    INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_queue_items_ready
        ON queue_items (namespace, leased, priority, id)
    "#,
];

/// Handle on the queue file shared by every namespace
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
}

impl QueueStore {
    /// Open (or create) the queue file and recover items leased by a
    /// previous process.
    pub async fn open(path: &Path) -> QueueResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| QueueError::Setup {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let recovered = sqlx::query("UPDATE queue_items SET leased = 0 WHERE leased = 1")
            .execute(&pool)
            .await?
            .rows_affected();

        if recovered > 0 {
            tracing::warn!(
                recovered,
                path = %path.display(),
                "Recovered queue items leased by a previous process"
            );
        }

        tracing::info!(path = %path.display(), "Queue store opened");

        Ok(Self { pool })
    }

    /// Queue view for one namespace
    pub fn queue(&self, namespace: impl Into<String>) -> RetryQueue {
        RetryQueue {
            pool: self.pool.clone(),
            namespace: namespace.into(),
        }
    }

    /// Flush and close the underlying file. Further operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Queue store closed");
    }
}

/// One namespace of the durable queue.
///
/// Cheap to clone; all clones share the store's connection pool, which
/// serializes writers internally.
#[derive(Clone)]
pub struct RetryQueue {
    pool: SqlitePool,
    namespace: String,
}

impl RetryQueue {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Persist an item. Returns only after the write is committed.
    pub async fn enqueue(&self, payload: &[u8], priority: u8) -> QueueResult<()> {
        sqlx::query("INSERT INTO queue_items (namespace, priority, payload) VALUES (?1, ?2, ?3)")
            .bind(&self.namespace)
            .bind(i64::from(priority))
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lease every pending item sharing the lowest priority value present,
    /// in FIFO order. Empty when nothing is pending.
    pub async fn dequeue_batch(&self) -> QueueResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_items
            SET leased = 1
            WHERE namespace = ?1
              AND leased = 0
              AND priority = (
                  SELECT MIN(priority) FROM queue_items
                  WHERE namespace = ?1 AND leased = 0
              )
            RETURNING id, priority, payload
            "#,
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.try_get("id")?;
                let priority: i64 = row.try_get("priority")?;
                let payload: Vec<u8> = row.try_get("payload")?;
                let priority = u8::try_from(priority).map_err(|_| QueueError::Corrupt {
                    id,
                    reason: format!("priority {priority} out of range"),
                })?;
                Ok(QueueItem {
                    id,
                    priority,
                    payload,
                })
            })
            .collect::<QueueResult<Vec<_>>>()?;

        // RETURNING order is unspecified
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    /// Remove a leased item after it was applied.
    pub async fn complete(&self, item: &QueueItem) -> QueueResult<()> {
        sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(item.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Put a leased item back at `priority`, behind everything already
    /// waiting at that priority.
    pub async fn requeue(&self, item: &QueueItem, priority: u8) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_items WHERE id = ?1")
            .bind(item.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO queue_items (namespace, priority, payload) VALUES (?1, ?2, ?3)")
            .bind(&self.namespace)
            .bind(i64::from(priority))
            .bind(&item.payload)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Release leased items untouched: same priority, same FIFO position.
    pub async fn restore(&self, items: &[QueueItem]) -> QueueResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query("UPDATE queue_items SET leased = 0 WHERE id = ?1")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Number of pending items
    pub async fn len(&self) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items WHERE namespace = ?1 AND leased = 0",
        )
        .bind(&self.namespace)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub async fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Number of items currently leased to a worker
    pub async fn in_flight(&self) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items WHERE namespace = ?1 AND leased = 1",
        )
        .bind(&self.namespace)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
