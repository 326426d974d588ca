//! Reminder repository
//!
//! Recurring reminders form a chain: when a due reminder is sent, exactly
//! one successor row is inserted with `parent_reminder_id` pointing back.

use chrono::{DateTime, Utc};

use super::{parse_datetime, DbPool};
use crate::{Error, Result};

/// A scheduled reminder
#[derive(Debug, Clone)]
pub struct Reminder {
    pub id: i64,
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub message: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
    /// JSON array of button labels, when the reminder renders as buttons
    pub buttons: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub recurrence: String,
    pub recurrence_end_at: Option<DateTime<Utc>>,
    pub parent_reminder_id: Option<i64>,
}

/// Fields for inserting a reminder
#[derive(Debug, Clone)]
pub struct NewReminder {
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub message: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
    pub buttons: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub recurrence: String,
    pub recurrence_end_at: Option<DateTime<Utc>>,
    pub parent_reminder_id: Option<i64>,
}

/// Reminder repository
#[derive(Clone)]
pub struct ReminderRepo {
    pool: DbPool,
}

impl ReminderRepo {
    /// Create a new reminder repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a reminder
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, new: &NewReminder) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT INTO reminders
                (tenant_id, conversation_id, message, media_url, media_kind, buttons,
                 scheduled_at, recurrence, recurrence_end_at, parent_reminder_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                new.tenant_id,
                new.conversation_id,
                new.message,
                new.media_url,
                new.media_kind,
                new.buttons,
                new.scheduled_at.to_rfc3339(),
                new.recurrence,
                new.recurrence_end_at.map(|d| d.to_rfc3339()),
                new.parent_reminder_id,
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    /// List scheduled reminders due at or before `now`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reminder>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_SQL} WHERE status = 'scheduled' AND scheduled_at <= ?1
                 ORDER BY scheduled_at LIMIT ?2"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let reminders = stmt
            .query_map(
                rusqlite::params![now.to_rfc3339(), limit as i64],
                map_reminder,
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(reminders)
    }

    /// Find a reminder by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: i64) -> Result<Option<Reminder>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let reminder = conn
            .query_row(&format!("{SELECT_SQL} WHERE id = ?1"), [id], map_reminder)
            .ok();

        Ok(reminder)
    }

    /// Mark a reminder sent
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
            "UPDATE reminders SET status = 'sent', sent_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Mark a reminder failed with an error message
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE reminders SET status = 'failed', error = ?1 WHERE id = ?2",
            rusqlite::params![error, id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Count successors already chained to a reminder
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn successor_count(&self, parent_id: i64) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM reminders WHERE parent_reminder_id = ?1",
                [parent_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count)
    }
}

const SELECT_SQL: &str = "SELECT id, tenant_id, conversation_id, message, media_url, media_kind,
        buttons, scheduled_at, status, recurrence, recurrence_end_at, parent_reminder_id
 FROM reminders";

fn map_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        conversation_id: row.get(2)?,
        message: row.get(3)?,
        media_url: row.get(4)?,
        media_kind: row.get(5)?,
        buttons: row.get(6)?,
        scheduled_at: parse_datetime(&row.get::<_, String>(7)?),
        status: row.get(8)?,
        recurrence: row.get(9)?,
        recurrence_end_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_datetime(&s)),
        parent_reminder_id: row.get(11)?,
    })
}
