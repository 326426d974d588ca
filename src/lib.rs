//! Courier gateway: multi-tenant `WhatsApp` message ingestion core
//!
//! Ingests customer messages from the official Cloud API webhook and the
//! unofficial socket-session protocol, normalizes them into one canonical
//! model, resolves leads and conversations per tenant, persists exactly
//! once, and fans events out to operator WebSocket sessions. Background
//! workers handle reminders, ticket-status demotion, and the outbound
//! send queue.

pub mod api;
pub mod channels;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod media;
pub mod workers;

pub use config::Config;
pub use db::DbPool;
pub use error::{Error, Result};
