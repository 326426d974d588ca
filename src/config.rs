//! Configuration management for Courier gateway

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::{Error, Result};

/// Courier gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the `SQLite` database file
    pub db_path: PathBuf,

    /// HTTP server port
    pub port: u16,

    /// `WhatsApp` Cloud API settings
    pub cloud: CloudConfig,

    /// Media storage settings
    pub media: MediaConfig,
}

/// `WhatsApp` Cloud API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Graph API base URL
    #[serde(default = "default_graph_base")]
    pub graph_base: String,

    /// Graph API version segment (e.g. "v21.0")
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// App secret used to verify `X-Hub-Signature-256` on webhook posts.
    /// Required in production; optional in development.
    #[serde(default)]
    pub app_secret: Option<String>,

    /// Token echoed back during the webhook GET handshake
    #[serde(default)]
    pub verify_token: Option<String>,

    /// Send read receipts for inbound cloud messages
    #[serde(default)]
    pub mark_read: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            graph_base: default_graph_base(),
            api_version: default_api_version(),
            app_secret: None,
            verify_token: None,
            mark_read: false,
        }
    }
}

/// Media storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory where downloaded media files are written
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    /// Download media for backfilled (append) messages too.
    /// Fresh (notify) messages always fetch media eagerly.
    #[serde(default)]
    pub fetch_on_append: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            fetch_on_append: false,
        }
    }
}

/// On-disk config file shape (all sections optional)
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    port: Option<u16>,
    #[serde(default)]
    cloud: Option<CloudConfig>,
    #[serde(default)]
    media: Option<MediaConfig>,
}

fn default_graph_base() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v21.0".to_string()
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

impl Config {
    /// Load configuration from an optional TOML file with env overrides
    ///
    /// Env vars take precedence over the file: `COURIER_DB_PATH`,
    /// `COURIER_PORT`, `WHATSAPP_APP_SECRET`, `WHATSAPP_VERIFY_TOKEN`,
    /// `WHATSAPP_GRAPH_BASE`, `WHATSAPP_API_VERSION`, `COURIER_UPLOADS_DIR`.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed, or if
    /// `NODE_ENV`/`COURIER_ENV` is `production` and no app secret is set.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let file: ConfigFile = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)?
            }
            _ => ConfigFile::default(),
        };

        let mut cloud = file.cloud.unwrap_or_default();
        if let Ok(secret) = env::var("WHATSAPP_APP_SECRET") {
            if !secret.is_empty() {
                cloud.app_secret = Some(secret);
            }
        }
        if let Ok(token) = env::var("WHATSAPP_VERIFY_TOKEN") {
            if !token.is_empty() {
                cloud.verify_token = Some(token);
            }
        }
        if let Ok(base) = env::var("WHATSAPP_GRAPH_BASE") {
            cloud.graph_base = base;
        }
        if let Ok(version) = env::var("WHATSAPP_API_VERSION") {
            cloud.api_version = version;
        }

        let mut media = file.media.unwrap_or_default();
        if let Ok(dir) = env::var("COURIER_UPLOADS_DIR") {
            media.uploads_dir = PathBuf::from(dir);
        }

        let db_path = env::var("COURIER_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(|| PathBuf::from("courier.db"));

        let port = env::var("COURIER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or(file.port)
            .unwrap_or(8080);

        let config = Self {
            db_path,
            port,
            cloud,
            media,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject unsafe production setups
    ///
    /// A missing webhook app secret in production means unsigned posts would
    /// be accepted, so startup fails instead.
    fn validate(&self) -> Result<()> {
        let env_name = env::var("COURIER_ENV")
            .or_else(|_| env::var("NODE_ENV"))
            .unwrap_or_default();

        if env_name == "production" && self.cloud.app_secret.is_none() {
            return Err(Error::Config(
                "WHATSAPP_APP_SECRET is required in production".to_string(),
            ));
        }

        if env_name != "production" && self.cloud.app_secret.is_none() {
            tracing::warn!("webhook signature verification disabled (no app secret configured)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cloud.graph_base, "https://graph.facebook.com");
        assert!(!config.media.fetch_on_append);
    }

    #[test]
    fn test_file_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        std::fs::write(
            &path,
            r#"
port = 9000

[cloud]
verify_token = "hub-token"
mark_read = true

[media]
uploads_dir = "/tmp/uploads"
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.cloud.verify_token.as_deref(), Some("hub-token"));
        assert!(config.cloud.mark_read);
        assert_eq!(config.media.uploads_dir, PathBuf::from("/tmp/uploads"));
    }
}
