//! `WhatsApp` number and connection repository
//!
//! Numbers carry the Cloud API credentials and per-number send counters.
//! Connections map a routing key (cloud `phone_number_id` or socket session
//! id) back to the owning tenant.

use chrono::{DateTime, Utc};

use super::{parse_datetime, DbPool};
use crate::ingest::canonical::ConnectionType;
use crate::{Error, Result};

/// A tenant-owned `WhatsApp` number
#[derive(Debug, Clone)]
pub struct WhatsappNumber {
    pub id: i64,
    pub tenant_id: i64,
    pub display_number: String,
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub daily_sent: i64,
    pub total_sent: i64,
    pub counter_date: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A channel connection for a number
#[derive(Debug, Clone)]
pub struct WhatsappConnection {
    pub id: i64,
    pub tenant_id: i64,
    pub whatsapp_number_id: i64,
    pub connection_type: ConnectionType,
    pub external_id: Option<String>,
    pub status: String,
}

/// Number and connection repository
#[derive(Clone)]
pub struct NumberRepo {
    pool: DbPool,
}

impl NumberRepo {
    /// Create a new number repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Look up a number by its Cloud API phone number id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<WhatsappNumber>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let number = conn
            .query_row(
                "SELECT id, tenant_id, display_number, phone_number_id, access_token,
                        daily_sent, total_sent, counter_date, created_at
                 FROM whatsapp_numbers WHERE phone_number_id = ?1",
                [phone_number_id],
                map_number,
            )
            .ok();

        Ok(number)
    }

    /// Look up a number by row id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: i64) -> Result<Option<WhatsappNumber>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let number = conn
            .query_row(
                "SELECT id, tenant_id, display_number, phone_number_id, access_token,
                        daily_sent, total_sent, counter_date, created_at
                 FROM whatsapp_numbers WHERE id = ?1",
                [id],
                map_number,
            )
            .ok();

        Ok(number)
    }

    /// Look up a connection by routing key
    ///
    /// For `api` the key is the cloud phone number id (resolved through the
    /// numbers table); for `qr` it is the socket session id.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_connection(
        &self,
        connection_type: ConnectionType,
        external_id: &str,
    ) -> Result<Option<WhatsappConnection>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let row = match connection_type {
            ConnectionType::Api => conn
                .query_row(
                    "SELECT c.id, c.tenant_id, c.whatsapp_number_id, c.connection_type,
                            c.external_id, c.status
                     FROM whatsapp_connections c
                     JOIN whatsapp_numbers n ON n.id = c.whatsapp_number_id
                     WHERE c.connection_type = 'api' AND n.phone_number_id = ?1",
                    [external_id],
                    map_connection,
                )
                .ok(),
            ConnectionType::Qr => conn
                .query_row(
                    "SELECT id, tenant_id, whatsapp_number_id, connection_type,
                            external_id, status
                     FROM whatsapp_connections
                     WHERE connection_type = 'qr' AND external_id = ?1",
                    [external_id],
                    map_connection,
                )
                .ok(),
        };

        Ok(row)
    }

    /// Bump the per-number send counters, resetting the daily count on a
    /// date change
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_sent(&self, number_id: i64) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let today = Utc::now().format("%Y-%m-%d").to_string();

        conn.execute(
            "UPDATE whatsapp_numbers SET
                daily_sent = CASE WHEN counter_date = ?1 THEN daily_sent + 1 ELSE 1 END,
                total_sent = total_sent + 1,
                counter_date = ?1
             WHERE id = ?2",
            rusqlite::params![today, number_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Zero the daily counters for numbers whose counter date is stale
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn reset_stale_daily_counters(&self) -> Result<usize> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let today = Utc::now().format("%Y-%m-%d").to_string();

        let updated = conn
            .execute(
                "UPDATE whatsapp_numbers SET daily_sent = 0, counter_date = ?1
                 WHERE counter_date IS NOT NULL AND counter_date <> ?1",
                [&today],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(updated)
    }
}

fn map_number(row: &rusqlite::Row<'_>) -> rusqlite::Result<WhatsappNumber> {
    Ok(WhatsappNumber {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        display_number: row.get(2)?,
        phone_number_id: row.get(3)?,
        access_token: row.get(4)?,
        daily_sent: row.get(5)?,
        total_sent: row.get(6)?,
        counter_date: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn map_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<WhatsappConnection> {
    let raw: String = row.get(3)?;
    Ok(WhatsappConnection {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        whatsapp_number_id: row.get(2)?,
        connection_type: ConnectionType::parse(&raw).unwrap_or(ConnectionType::Api),
        external_id: row.get(4)?,
        status: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> NumberRepo {
        let pool = init_memory().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "INSERT INTO tenants (name) VALUES ('t1');
             INSERT INTO whatsapp_numbers (tenant_id, display_number, phone_number_id, access_token)
                 VALUES (1, '+15550001', 'pnid-1', 'token-1');
             INSERT INTO whatsapp_connections (tenant_id, whatsapp_number_id, connection_type)
                 VALUES (1, 1, 'api');
             INSERT INTO whatsapp_connections (tenant_id, whatsapp_number_id, connection_type, external_id)
                 VALUES (1, 1, 'qr', 'session-9');",
        )
        .unwrap();
        NumberRepo::new(pool)
    }

    #[test]
    fn test_find_by_phone_number_id() {
        let repo = setup();
        let number = repo.find_by_phone_number_id("pnid-1").unwrap().unwrap();
        assert_eq!(number.tenant_id, 1);
        assert_eq!(number.access_token.as_deref(), Some("token-1"));
        assert!(repo.find_by_phone_number_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_find_connection_by_routing_key() {
        let repo = setup();

        let api = repo
            .find_connection(ConnectionType::Api, "pnid-1")
            .unwrap()
            .unwrap();
        assert_eq!(api.connection_type, ConnectionType::Api);
        assert_eq!(api.whatsapp_number_id, 1);

        let qr = repo
            .find_connection(ConnectionType::Qr, "session-9")
            .unwrap()
            .unwrap();
        assert_eq!(qr.connection_type, ConnectionType::Qr);

        assert!(repo
            .find_connection(ConnectionType::Qr, "unknown")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_record_sent_counters() {
        let repo = setup();
        repo.record_sent(1).unwrap();
        repo.record_sent(1).unwrap();

        let number = repo.find(1).unwrap().unwrap();
        assert_eq!(number.daily_sent, 2);
        assert_eq!(number.total_sent, 2);
    }

    #[test]
    fn test_daily_counter_reset() {
        let repo = setup();
        repo.record_sent(1).unwrap();

        // Force yesterday's counter date, then reset
        {
            let conn = repo.pool.get().unwrap();
            conn.execute(
                "UPDATE whatsapp_numbers SET counter_date = '2000-01-01' WHERE id = 1",
                [],
            )
            .unwrap();
        }

        assert_eq!(repo.reset_stale_daily_counters().unwrap(), 1);
        let number = repo.find(1).unwrap().unwrap();
        assert_eq!(number.daily_sent, 0);
        assert_eq!(number.total_sent, 1);

        // Next send starts a fresh day at 1
        repo.record_sent(1).unwrap();
        let number = repo.find(1).unwrap().unwrap();
        assert_eq!(number.daily_sent, 1);
    }
}
