//! Outbound message queue repository
//!
//! Claiming happens inside one transaction so two workers never grab the
//! same row; the actual network send runs after the transaction commits.

use chrono::{DateTime, Duration, Utc};

use super::{parse_datetime, DbPool};
use crate::{Error, Result};

/// Max delivery attempts before a queue item is abandoned
pub const MAX_ATTEMPTS: i64 = 5;

/// Items stuck in `processing` longer than this are reclaimed
pub const STALE_PROCESSING_MINUTES: i64 = 5;

/// A claimed queue item
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub message_id: Option<String>,
    /// Serialized `OutboundPayload`
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Queue repository
#[derive(Clone)]
pub struct QueueRepo {
    pool: DbPool,
}

impl QueueRepo {
    /// Create a new queue repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue an outbound payload
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn enqueue(
        &self,
        tenant_id: i64,
        conversation_id: i64,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO message_queue (tenant_id, conversation_id, message_id, payload, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                tenant_id,
                conversation_id,
                message_id,
                payload,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    /// Claim a batch of due items, marking them `processing`
    ///
    /// Due means: `queued`/`failed` with attempts under the cap and
    /// `next_attempt_at` elapsed, plus `processing` rows stuck past the
    /// stale window (a worker died mid-send). The whole claim runs in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueItem>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        let stale_cutoff = (now - Duration::minutes(STALE_PROCESSING_MINUTES)).to_rfc3339();
        let now_str = now.to_rfc3339();

        let items: Vec<QueueItem> = {
            let mut stmt = tx
                .prepare(&format!(
                    "{SELECT_SQL}
                     WHERE (status IN ('queued', 'failed')
                            AND attempts < ?1
                            AND (next_attempt_at IS NULL OR next_attempt_at <= ?2))
                        OR (status = 'processing' AND processing_at < ?3)
                     ORDER BY next_attempt_at LIMIT ?4"
                ))
                .map_err(|e| Error::Database(e.to_string()))?;

            #[allow(clippy::cast_possible_wrap)]
            let rows = stmt
                .query_map(
                    rusqlite::params![MAX_ATTEMPTS, now_str, stale_cutoff, limit as i64],
                    map_item,
                )
                .map_err(|e| Error::Database(e.to_string()))?;
            rows.filter_map(std::result::Result::ok).collect()
        };

        for item in &items {
            tx.execute(
                "UPDATE message_queue SET status = 'processing', processing_at = ?1 WHERE id = ?2",
                rusqlite::params![now_str, item.id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit().map_err(|e| Error::Database(e.to_string()))?;
        Ok(items)
    }

    /// Mark a claimed item sent
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_sent(&self, id: i64) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE message_queue SET status = 'sent', processing_at = NULL WHERE id = ?1",
            [id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Mark a claimed item failed, scheduling the next attempt with
    /// exponential backoff
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_failed(&self, id: i64, attempts: i64, error: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let next = Utc::now() + backoff(attempts);
        conn.execute(
            "UPDATE message_queue SET status = 'failed', attempts = ?1,
                next_attempt_at = ?2, last_error = ?3, processing_at = NULL
             WHERE id = ?4",
            rusqlite::params![attempts, next.to_rfc3339(), error, id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Find a queue item by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: i64) -> Result<Option<QueueItem>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let item = conn
            .query_row(&format!("{SELECT_SQL} WHERE id = ?1"), [id], map_item)
            .ok();

        Ok(item)
    }
}

/// Backoff delay after the given attempt count: `2^(n+1) * 30s`
#[must_use]
pub fn backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 10) + 1;
    Duration::seconds(30 * (1_i64 << exp))
}

const SELECT_SQL: &str = "SELECT id, tenant_id, conversation_id, message_id, payload, status,
        attempts, next_attempt_at, last_error
 FROM message_queue";

fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        conversation_id: row.get(2)?,
        message_id: row.get(3)?,
        payload: row.get(4)?,
        status: row.get(5)?,
        attempts: row.get(6)?,
        next_attempt_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_datetime(&s)),
        last_error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> QueueRepo {
        let pool = init_memory().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "INSERT INTO tenants (name) VALUES ('t1');
             INSERT INTO whatsapp_numbers (tenant_id, display_number) VALUES (1, '+100');
             INSERT INTO leads (tenant_id, phone) VALUES (1, '+200');
             INSERT INTO conversations (tenant_id, lead_id, whatsapp_number_id, connection_type, external_chat_id)
                 VALUES (1, 1, 1, 'api', '200@c.us');",
        )
        .unwrap();
        QueueRepo::new(pool)
    }

    #[test]
    fn test_claim_marks_processing() {
        let repo = setup();
        let id = repo.enqueue(1, 1, None, "{\"type\":\"text\"}").unwrap();

        let claimed = repo.claim_due(Utc::now(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);

        // Already claimed; a second pass sees nothing
        assert!(repo.claim_due(Utc::now(), 10).unwrap().is_empty());
    }

    #[test]
    fn test_failed_items_retry_after_backoff() {
        let repo = setup();
        let id = repo.enqueue(1, 1, None, "{}").unwrap();
        let item = repo.claim_due(Utc::now(), 10).unwrap().remove(0);

        repo.mark_failed(id, item.attempts + 1, "timeout").unwrap();

        // Not due yet
        assert!(repo.claim_due(Utc::now(), 10).unwrap().is_empty());

        // Due once the backoff window elapses
        let later = Utc::now() + backoff(1) + Duration::seconds(1);
        let retried = repo.claim_due(later, 10).unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempts, 1);
    }

    #[test]
    fn test_attempt_cap() {
        let repo = setup();
        let id = repo.enqueue(1, 1, None, "{}").unwrap();
        repo.claim_due(Utc::now(), 10).unwrap();
        repo.mark_failed(id, MAX_ATTEMPTS, "gave up").unwrap();

        let far_future = Utc::now() + Duration::days(30);
        assert!(repo.claim_due(far_future, 10).unwrap().is_empty());
    }

    #[test]
    fn test_stale_processing_reclaim() {
        let repo = setup();
        let id = repo.enqueue(1, 1, None, "{}").unwrap();
        repo.claim_due(Utc::now(), 10).unwrap();

        // A crashed worker left the row in processing; reclaim after the window
        let later = Utc::now() + Duration::minutes(STALE_PROCESSING_MINUTES + 1);
        let reclaimed = repo.claim_due(later, 10).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, id);
    }

    #[test]
    fn test_backoff_grows() {
        assert_eq!(backoff(0).num_seconds(), 60);
        assert_eq!(backoff(1).num_seconds(), 120);
        assert_eq!(backoff(4).num_seconds(), 960);
    }
}
