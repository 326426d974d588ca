//! Message repository
//!
//! The unique index on `(tenant, number, connection, provider_message_id)`
//! is the idempotency barrier: a redelivered provider event inserts zero
//! rows no matter how many workers race on it.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{parse_datetime, DbPool};
use crate::ingest::canonical::{ConnectionType, DeliveryStatus, Direction, MessageKind};
use crate::{Error, Result};

/// A stored message
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub whatsapp_number_id: i64,
    pub connection_type: ConnectionType,
    pub provider_message_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub media_filename: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: DeliveryStatus,
    pub status_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Fields for inserting a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub tenant_id: i64,
    pub conversation_id: i64,
    pub whatsapp_number_id: i64,
    pub connection_type: ConnectionType,
    pub provider_message_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_mime: Option<String>,
    pub media_filename: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub sent_at: DateTime<Utc>,
}

/// Message repository
#[derive(Clone)]
pub struct MessageRepo {
    pool: DbPool,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a message, returning `None` when the provider id was already
    /// stored for this routing identity
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, new: &NewMessage) -> Result<Option<MessageRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let sent_at = new.sent_at.to_rfc3339();

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO messages
                    (id, tenant_id, conversation_id, whatsapp_number_id, connection_type,
                     provider_message_id, direction, kind, content, media_url, media_mime,
                     media_filename, latitude, longitude, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                rusqlite::params![
                    id,
                    new.tenant_id,
                    new.conversation_id,
                    new.whatsapp_number_id,
                    new.connection_type.as_str(),
                    new.provider_message_id,
                    new.direction.as_str(),
                    new.kind.as_str(),
                    new.content,
                    new.media_url,
                    new.media_mime,
                    new.media_filename,
                    new.latitude,
                    new.longitude,
                    sent_at,
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        if inserted == 0 {
            return Ok(None);
        }

        self.find(&id)
    }

    /// Whether a provider message id is already stored for a routing identity
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn exists(
        &self,
        tenant_id: i64,
        whatsapp_number_id: i64,
        connection_type: ConnectionType,
        provider_message_id: &str,
    ) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE tenant_id = ?1 AND whatsapp_number_id = ?2
                   AND connection_type = ?3 AND provider_message_id = ?4",
                rusqlite::params![
                    tenant_id,
                    whatsapp_number_id,
                    connection_type.as_str(),
                    provider_message_id
                ],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(count > 0)
    }

    /// Find a message by uuid
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: &str) -> Result<Option<MessageRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let message = conn
            .query_row(&format!("{SELECT_SQL} WHERE id = ?1"), [id], map_message)
            .ok();

        Ok(message)
    }

    /// Apply a delivery status update by provider id, tenant-scoped
    ///
    /// Returns the updated message, or `None` if the provider id is unknown
    /// for this tenant.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update_status(
        &self,
        tenant_id: i64,
        whatsapp_number_id: i64,
        connection_type: ConnectionType,
        provider_message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<Option<MessageRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let updated = conn
            .execute(
                "UPDATE messages SET status = ?1, status_at = ?2, error = ?3
                 WHERE tenant_id = ?4 AND whatsapp_number_id = ?5
                   AND connection_type = ?6 AND provider_message_id = ?7",
                rusqlite::params![
                    status.as_str(),
                    at.to_rfc3339(),
                    error,
                    tenant_id,
                    whatsapp_number_id,
                    connection_type.as_str(),
                    provider_message_id
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if updated == 0 {
            return Ok(None);
        }

        let message = conn
            .query_row(
                &format!("{SELECT_SQL} WHERE tenant_id = ?1 AND whatsapp_number_id = ?2
                          AND connection_type = ?3 AND provider_message_id = ?4"),
                rusqlite::params![
                    tenant_id,
                    whatsapp_number_id,
                    connection_type.as_str(),
                    provider_message_id
                ],
                map_message,
            )
            .ok();

        Ok(message)
    }

    /// Set delivery status by message uuid (queue worker path)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status_by_id(
        &self,
        id: &str,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE messages SET status = ?1, status_at = ?2, error = ?3 WHERE id = ?4",
            rusqlite::params![status.as_str(), Utc::now().to_rfc3339(), error, id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// List messages for a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_conversation(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_SQL} WHERE conversation_id = ?1 ORDER BY sent_at DESC LIMIT ?2"
            ))
            .map_err(|e| Error::Database(e.to_string()))?;

        #[allow(clippy::cast_possible_wrap)]
        let messages: Vec<MessageRecord> = stmt
            .query_map(rusqlite::params![conversation_id, limit as i64], map_message)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(messages.into_iter().rev().collect())
    }
}

const SELECT_SQL: &str = "SELECT id, tenant_id, conversation_id, whatsapp_number_id,
        connection_type, provider_message_id, direction, kind, content, media_url,
        media_mime, media_filename, latitude, longitude, status, status_at, error, sent_at
 FROM messages";

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let connection: String = row.get(4)?;
    let direction: String = row.get(6)?;
    let kind: String = row.get(7)?;
    let status: String = row.get(14)?;

    Ok(MessageRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        conversation_id: row.get(2)?,
        whatsapp_number_id: row.get(3)?,
        connection_type: ConnectionType::parse(&connection).unwrap_or(ConnectionType::Api),
        provider_message_id: row.get(5)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Inbound),
        kind: MessageKind::parse(&kind).unwrap_or(MessageKind::Text),
        content: row.get(8)?,
        media_url: row.get(9)?,
        media_mime: row.get(10)?,
        media_filename: row.get(11)?,
        latitude: row.get(12)?,
        longitude: row.get(13)?,
        status: DeliveryStatus::parse(&status).unwrap_or(DeliveryStatus::Sent),
        status_at: row
            .get::<_, Option<String>>(15)?
            .map(|s| parse_datetime(&s)),
        error: row.get(16)?,
        sent_at: parse_datetime(&row.get::<_, String>(17)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> MessageRepo {
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
        MessageRepo::new(pool)
    }

    fn text_message(provider_id: &str) -> NewMessage {
        NewMessage {
            tenant_id: 1,
            conversation_id: 1,
            whatsapp_number_id: 1,
            connection_type: ConnectionType::Api,
            provider_message_id: provider_id.to_string(),
            direction: Direction::Inbound,
            kind: MessageKind::Text,
            content: Some("hola".to_string()),
            media_url: None,
            media_mime: None,
            media_filename: None,
            latitude: None,
            longitude: None,
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_dedup() {
        let repo = setup();

        let first = repo.insert(&text_message("wamid.1")).unwrap();
        assert!(first.is_some());

        // Redelivery inserts nothing
        let second = repo.insert(&text_message("wamid.1")).unwrap();
        assert!(second.is_none());

        assert!(repo.exists(1, 1, ConnectionType::Api, "wamid.1").unwrap());
        assert!(!repo.exists(1, 1, ConnectionType::Qr, "wamid.1").unwrap());
    }

    #[test]
    fn test_status_update_by_provider_id() {
        let repo = setup();
        repo.insert(&text_message("wamid.1")).unwrap();

        let updated = repo
            .update_status(
                1,
                1,
                ConnectionType::Api,
                "wamid.1",
                DeliveryStatus::Read,
                Utc::now(),
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Read);

        // Unknown provider id is a no-op
        let missing = repo
            .update_status(
                1,
                1,
                ConnectionType::Api,
                "wamid.unknown",
                DeliveryStatus::Delivered,
                Utc::now(),
                None,
            )
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_list_chronological() {
        let repo = setup();
        let mut early = text_message("wamid.1");
        early.sent_at = "2030-01-01T00:00:00Z".parse().unwrap();
        let mut late = text_message("wamid.2");
        late.sent_at = "2030-01-02T00:00:00Z".parse().unwrap();

        repo.insert(&late).unwrap();
        repo.insert(&early).unwrap();

        let messages = repo.list_for_conversation(1, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].provider_message_id, "wamid.1");
        assert_eq!(messages[1].provider_message_id, "wamid.2");
    }
}
