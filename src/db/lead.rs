//! Lead repository
//!
//! Leads are keyed per tenant by normalized phone. New inbound leads land on
//! the default pipeline's first stage at the bottom of the kanban column.

use chrono::{DateTime, Utc};

use super::{parse_datetime, DbPool};
use crate::{Error, Result};

/// A CRM lead
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: i64,
    pub tenant_id: i64,
    pub phone: String,
    pub name: Option<String>,
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub kanban_order: i64,
    pub source: Option<String>,
    pub last_contacted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Lead repository
#[derive(Clone)]
pub struct LeadRepo {
    pool: DbPool,
}

impl LeadRepo {
    /// Create a new lead repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find or create a lead by `(tenant, phone)`
    ///
    /// On create: assigns the tenant's default pipeline and its first stage,
    /// places the card after the current column maximum, and tags the source
    /// as `whatsapp_inbound`. When the provider gives no contact name the
    /// normalized phone stands in until a real name arrives. A concurrent
    /// insert losing the unique-index race falls back to re-reading the
    /// winner's row.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_or_create(&self, tenant_id: i64, phone: &str, name: Option<&str>) -> Result<Lead> {
        if let Some(lead) = self.find_by_phone(tenant_id, phone)? {
            return Ok(lead);
        }

        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        // Default pipeline's first stage, when the tenant has one
        let placement: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT p.id,
                        (SELECT s.id FROM pipeline_stages s
                         WHERE s.pipeline_id = p.id ORDER BY s.position LIMIT 1)
                 FROM pipelines p
                 WHERE p.tenant_id = ?1 AND p.is_default = 1
                 LIMIT 1",
                [tenant_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let (pipeline_id, stage_id) = placement.map_or((None, None), |(p, s)| (Some(p), s));

        let next_order: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(kanban_order), 0) + 1 FROM leads
                 WHERE tenant_id = ?1 AND stage_id IS ?2",
                rusqlite::params![tenant_id, stage_id],
                |row| row.get(0),
            )
            .unwrap_or(1);

        let now = Utc::now().to_rfc3339();
        let display_name = name.unwrap_or(phone);
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO leads
                (tenant_id, phone, name, pipeline_id, stage_id, kanban_order, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'whatsapp_inbound', ?7)",
            rusqlite::params![tenant_id, phone, display_name, pipeline_id, stage_id, next_order, now],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        if inserted == 0 {
            tracing::debug!(tenant_id, phone, "lost lead insert race, re-reading");
        }

        self.find_by_phone(tenant_id, phone)?
            .ok_or_else(|| Error::Database(format!("lead vanished after insert: {phone}")))
    }

    /// Find a lead by `(tenant, phone)`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find_by_phone(&self, tenant_id: i64, phone: &str) -> Result<Option<Lead>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let lead = conn
            .query_row(
                "SELECT id, tenant_id, phone, name, pipeline_id, stage_id, kanban_order,
                        source, last_contacted_at, created_at
                 FROM leads WHERE tenant_id = ?1 AND phone = ?2",
                rusqlite::params![tenant_id, phone],
                map_lead,
            )
            .ok();

        Ok(lead)
    }

    /// Advance `last_contacted_at`, never moving it backwards
    ///
    /// Also upgrades the lead name when the provider supplied one and the
    /// lead still carries the phone placeholder.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch(&self, lead_id: i64, at: DateTime<Utc>, name: Option<&str>) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let at_str = at.to_rfc3339();
        conn.execute(
            "UPDATE leads SET
                last_contacted_at = CASE
                    WHEN last_contacted_at IS NULL OR last_contacted_at < ?1 THEN ?1
                    ELSE last_contacted_at END,
                name = CASE
                    WHEN ?2 IS NOT NULL AND (name IS NULL OR name = phone) THEN ?2
                    ELSE name END
             WHERE id = ?3",
            rusqlite::params![at_str, name, lead_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

fn map_lead(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        phone: row.get(2)?,
        name: row.get(3)?,
        pipeline_id: row.get(4)?,
        stage_id: row.get(5)?,
        kanban_order: row.get(6)?,
        source: row.get(7)?,
        last_contacted_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}
