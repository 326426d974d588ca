//! Conversation repository
//!
//! A conversation is identified by the full routing key
//! `(tenant, whatsapp_number, connection_type, external_chat_id)`; the same
//! customer talking over `api` and `qr` yields two conversations.

use chrono::{DateTime, Utc};

use super::{parse_datetime, DbPool};
use crate::ingest::canonical::ConnectionType;
use crate::{Error, Result};

/// A conversation with a lead over one channel
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: i64,
    pub tenant_id: i64,
    pub lead_id: i64,
    pub whatsapp_number_id: i64,
    pub connection_type: ConnectionType,
    pub external_chat_id: String,
    pub status: String,
    pub ticket_status: String,
    pub unread_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Conversation repository
#[derive(Clone)]
pub struct ConversationRepo {
    pool: DbPool,
}

impl ConversationRepo {
    /// Create a new conversation repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find or create a conversation by its full identity key
    ///
    /// A concurrent insert losing the unique-index race re-reads the
    /// winner's row.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_or_create(
        &self,
        tenant_id: i64,
        lead_id: i64,
        whatsapp_number_id: i64,
        connection_type: ConnectionType,
        external_chat_id: &str,
    ) -> Result<Conversation> {
        if let Some(conversation) =
            self.find_by_identity(tenant_id, whatsapp_number_id, connection_type, external_chat_id)?
        {
            return Ok(conversation);
        }

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO conversations
                (tenant_id, lead_id, whatsapp_number_id, connection_type, external_chat_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                tenant_id,
                lead_id,
                whatsapp_number_id,
                connection_type.as_str(),
                external_chat_id
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        self.find_by_identity(tenant_id, whatsapp_number_id, connection_type, external_chat_id)?
            .ok_or_else(|| {
                Error::Database(format!("conversation vanished after insert: {external_chat_id}"))
            })
    }

    /// Find a conversation by its full identity key
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_identity(
        &self,
        tenant_id: i64,
        whatsapp_number_id: i64,
        connection_type: ConnectionType,
        external_chat_id: &str,
    ) -> Result<Option<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE tenant_id = ?1 AND whatsapp_number_id = ?2
                          AND connection_type = ?3 AND external_chat_id = ?4"),
                rusqlite::params![
                    tenant_id,
                    whatsapp_number_id,
                    connection_type.as_str(),
                    external_chat_id
                ],
                map_conversation,
            )
            .ok();

        Ok(conversation)
    }

    /// Find a conversation by row id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: i64) -> Result<Option<Conversation>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let conversation = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE id = ?1"),
                [id],
                map_conversation,
            )
            .ok();

        Ok(conversation)
    }

    /// Apply a fresh inbound message to the conversation
    ///
    /// Bumps unread, sets `last_message_at` to now, flips the conversation
    /// active, and reopens a closed ticket. Pending tickets stay pending.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_inbound(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE conversations SET
                unread_count = unread_count + 1,
                last_message_at = ?1,
                status = 'active',
                ticket_status = CASE WHEN ticket_status = 'closed' THEN 'open'
                                     ELSE ticket_status END
             WHERE id = ?2",
            rusqlite::params![at.to_rfc3339(), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Advance `last_message_at` without touching unread or ticket state
    ///
    /// Used for backfilled and outbound messages; the timestamp only ever
    /// moves forward.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn advance_last_message_at(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE conversations SET last_message_at = ?1
             WHERE id = ?2 AND (last_message_at IS NULL OR last_message_at < ?1)",
            rusqlite::params![at.to_rfc3339(), id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Reset the unread counter (operator opened the conversation)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_read(&self, id: i64) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute("UPDATE conversations SET unread_count = 0 WHERE id = ?1", [id])
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Demote open tickets whose last message predates the cutoff
    ///
    /// Returns the number of tickets moved to `pending`. Pending and closed
    /// tickets are never touched.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn demote_stale_open(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let updated = conn
            .execute(
                "UPDATE conversations SET ticket_status = 'pending'
                 WHERE ticket_status = 'open'
                   AND last_message_at IS NOT NULL
                   AND last_message_at < ?1",
                [cutoff.to_rfc3339()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(updated)
    }

    /// Set the ticket status directly (operator action)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_ticket_status(&self, id: i64, ticket_status: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE conversations SET ticket_status = ?1 WHERE id = ?2",
            rusqlite::params![ticket_status, id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

const SELECT_SQL: &str = "SELECT id, tenant_id, lead_id, whatsapp_number_id, connection_type,
        external_chat_id, status, ticket_status, unread_count, last_message_at, created_at
 FROM conversations";

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let raw: String = row.get(4)?;
    Ok(Conversation {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        lead_id: row.get(2)?,
        whatsapp_number_id: row.get(3)?,
        connection_type: ConnectionType::parse(&raw).unwrap_or(ConnectionType::Api),
        external_chat_id: row.get(5)?,
        status: row.get(6)?,
        ticket_status: row.get(7)?,
        unread_count: row.get(8)?,
        last_message_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}
