//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 4;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }
    if version < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Tenants table
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Operator users
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            name TEXT NOT NULL,
            email TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_users_tenant ON users(tenant_id);

        -- Operator auth sessions (token presented at WebSocket upgrade)
        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            expires_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

        -- Sales pipelines and their stages
        CREATE TABLE IF NOT EXISTS pipelines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pipelines_tenant ON pipelines(tenant_id);

        CREATE TABLE IF NOT EXISTS pipeline_stages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pipeline_id INTEGER NOT NULL REFERENCES pipelines(id),
            name TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_stages_pipeline ON pipeline_stages(pipeline_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Tenant-owned WhatsApp numbers
        CREATE TABLE IF NOT EXISTS whatsapp_numbers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            display_number TEXT NOT NULL,
            -- Cloud API routing key; NULL for qr-only numbers
            phone_number_id TEXT UNIQUE,
            access_token TEXT,
            daily_sent INTEGER NOT NULL DEFAULT 0,
            total_sent INTEGER NOT NULL DEFAULT 0,
            counter_date TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_numbers_tenant ON whatsapp_numbers(tenant_id);

        -- Channel connections for a number (one per connection type)
        CREATE TABLE IF NOT EXISTS whatsapp_connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            whatsapp_number_id INTEGER NOT NULL REFERENCES whatsapp_numbers(id),
            connection_type TEXT NOT NULL CHECK(connection_type IN ('api', 'qr')),
            -- Routing key for socket sessions (session id); NULL for api
            external_id TEXT,
            status TEXT NOT NULL DEFAULT 'disconnected',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(whatsapp_number_id, connection_type)
        );

        CREATE INDEX IF NOT EXISTS idx_connections_external
            ON whatsapp_connections(connection_type, external_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (numbers and connections)");
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Leads, keyed per tenant by normalized phone
        CREATE TABLE IF NOT EXISTS leads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            phone TEXT NOT NULL,
            name TEXT,
            pipeline_id INTEGER REFERENCES pipelines(id),
            stage_id INTEGER REFERENCES pipeline_stages(id),
            kanban_order INTEGER NOT NULL DEFAULT 0,
            source TEXT,
            last_contacted_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, phone)
        );

        CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);

        -- Conversations, one per (tenant, number, connection, chat)
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            lead_id INTEGER NOT NULL REFERENCES leads(id),
            whatsapp_number_id INTEGER NOT NULL REFERENCES whatsapp_numbers(id),
            connection_type TEXT NOT NULL CHECK(connection_type IN ('api', 'qr')),
            external_chat_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            ticket_status TEXT NOT NULL DEFAULT 'open'
                CHECK(ticket_status IN ('open', 'pending', 'closed')),
            unread_count INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(tenant_id, whatsapp_number_id, connection_type, external_chat_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_tenant ON conversations(tenant_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_ticket
            ON conversations(ticket_status, last_message_at);

        -- Messages; uuid primary key, provider id deduped per routing identity
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            whatsapp_number_id INTEGER NOT NULL REFERENCES whatsapp_numbers(id),
            connection_type TEXT NOT NULL CHECK(connection_type IN ('api', 'qr')),
            provider_message_id TEXT NOT NULL,
            direction TEXT NOT NULL CHECK(direction IN ('inbound', 'outbound')),
            kind TEXT NOT NULL,
            content TEXT,
            media_url TEXT,
            media_mime TEXT,
            media_filename TEXT,
            latitude REAL,
            longitude REAL,
            status TEXT NOT NULL DEFAULT 'sent'
                CHECK(status IN ('sent', 'delivered', 'read', 'failed')),
            status_at TEXT,
            error TEXT,
            sent_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider
            ON messages(tenant_id, whatsapp_number_id, connection_type, provider_message_id);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, sent_at);

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3 (leads, conversations, messages)");
    Ok(())
}

fn migrate_v4(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Scheduled reminders; recurrence chains via parent_reminder_id
        CREATE TABLE IF NOT EXISTS reminders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            message TEXT NOT NULL,
            media_url TEXT,
            media_kind TEXT,
            buttons TEXT,
            scheduled_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled'
                CHECK(status IN ('scheduled', 'sent', 'failed', 'cancelled')),
            recurrence TEXT NOT NULL DEFAULT 'none'
                CHECK(recurrence IN ('none', 'daily', 'weekly', 'monthly')),
            recurrence_end_at TEXT,
            parent_reminder_id INTEGER REFERENCES reminders(id),
            sent_at TEXT,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(status, scheduled_at);

        -- Outbound message queue
        CREATE TABLE IF NOT EXISTS message_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL REFERENCES tenants(id),
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            message_id TEXT REFERENCES messages(id),
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK(status IN ('queued', 'processing', 'sent', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT,
            processing_at TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_queue_due ON message_queue(status, next_attempt_at);

        PRAGMA user_version = 4;
        ",
    )?;

    tracing::info!("migrated to schema v4 (reminders and outbound queue)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='conversations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap(); // Should not fail
    }

    #[test]
    fn test_message_provider_id_unique_per_identity() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        conn.execute_batch(
            r"
            INSERT INTO tenants (name) VALUES ('t1');
            INSERT INTO whatsapp_numbers (tenant_id, display_number) VALUES (1, '+100');
            INSERT INTO leads (tenant_id, phone) VALUES (1, '+200');
            INSERT INTO conversations (tenant_id, lead_id, whatsapp_number_id, connection_type, external_chat_id)
                VALUES (1, 1, 1, 'api', '200@c.us');
            ",
        )
        .unwrap();

        let insert = "INSERT INTO messages
            (id, tenant_id, conversation_id, whatsapp_number_id, connection_type,
             provider_message_id, direction, kind, sent_at)
            VALUES (?1, 1, 1, 1, 'api', 'wamid.1', 'inbound', 'text', '2026-01-01T00:00:00Z')";

        conn.execute(insert, ["m1"]).unwrap();
        assert!(conn.execute(insert, ["m2"]).is_err());
    }
}
