//! Error types for Courier gateway

use thiserror::Error;

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Courier gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel error (provider API failures, disconnected sessions)
    #[error("channel error: {0}")]
    Channel(String),

    /// Ingestion error
    #[error("ingest error: {0}")]
    Ingest(String),

    /// Media download or storage error
    #[error("media error: {0}")]
    Media(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
