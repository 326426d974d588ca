//! Shared test utilities

#![allow(dead_code)]

use courier_gateway::{db, DbPool};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Create a tenant, returning its id
pub fn seed_tenant(db: &DbPool, name: &str) -> i64 {
    let conn = db.get().expect("pool");
    conn.execute("INSERT INTO tenants (name) VALUES (?1)", [name])
        .expect("insert tenant");
    conn.last_insert_rowid()
}

/// Create a WhatsApp number with optional Cloud API credentials
pub fn seed_number(
    db: &DbPool,
    tenant_id: i64,
    display_number: &str,
    phone_number_id: Option<&str>,
) -> i64 {
    let conn = db.get().expect("pool");
    let token = phone_number_id.map(|_| "test-token");
    conn.execute(
        "INSERT INTO whatsapp_numbers (tenant_id, display_number, phone_number_id, access_token)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![tenant_id, display_number, phone_number_id, token],
    )
    .expect("insert number");
    conn.last_insert_rowid()
}

/// Create a connection row for a number
pub fn seed_connection(
    db: &DbPool,
    tenant_id: i64,
    number_id: i64,
    connection_type: &str,
    external_id: Option<&str>,
) -> i64 {
    let conn = db.get().expect("pool");
    conn.execute(
        "INSERT INTO whatsapp_connections
             (tenant_id, whatsapp_number_id, connection_type, external_id, status)
         VALUES (?1, ?2, ?3, ?4, 'connected')",
        rusqlite::params![tenant_id, number_id, connection_type, external_id],
    )
    .expect("insert connection");
    conn.last_insert_rowid()
}

/// Create an operator with a session token, returning the user id
pub fn seed_session(db: &DbPool, tenant_id: i64, token: &str) -> i64 {
    let conn = db.get().expect("pool");
    conn.execute("INSERT INTO users (tenant_id, name) VALUES (?1, 'op')", [tenant_id])
        .expect("insert user");
    let user_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO sessions (token, user_id, tenant_id) VALUES (?1, ?2, ?3)",
        rusqlite::params![token, user_id, tenant_id],
    )
    .expect("insert session");
    user_id
}

/// Create a default pipeline with two stages, returning (pipeline, first stage)
pub fn seed_default_pipeline(db: &DbPool, tenant_id: i64) -> (i64, i64) {
    let conn = db.get().expect("pool");
    conn.execute(
        "INSERT INTO pipelines (tenant_id, name, is_default) VALUES (?1, 'Sales', 1)",
        [tenant_id],
    )
    .expect("insert pipeline");
    let pipeline_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO pipeline_stages (pipeline_id, name, position) VALUES (?1, 'New', 0)",
        [pipeline_id],
    )
    .expect("insert stage");
    let first_stage_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO pipeline_stages (pipeline_id, name, position) VALUES (?1, 'Contacted', 1)",
        [pipeline_id],
    )
    .expect("insert stage");

    (pipeline_id, first_stage_id)
}
