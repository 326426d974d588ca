//! Outbound channel adapters
//!
//! Both adapters take the same `OutboundPayload` and return the provider's
//! message id, which the status path later matches against.

pub mod cloud;
pub mod socket;

use serde::{Deserialize, Serialize};

pub use cloud::CloudClient;
pub use socket::{SessionRegistry, SocketTransport};

use crate::ingest::canonical::normalize_phone;
use crate::Result;

/// A quick-reply button
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ButtonSpec {
    pub id: String,
    pub title: String,
}

/// What to send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        body: String,
    },
    Media {
        kind: String,
        url: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        name: Option<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<ButtonSpec>,
    },
}

/// Normalize a stored peer/chat id to the bare digits the Cloud API expects
///
/// # Errors
///
/// Returns error if no phone digits remain
pub fn to_cloud_recipient(peer: &str) -> Result<String> {
    let normalized = normalize_phone(peer)?;
    Ok(normalized.trim_start_matches('+').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_recipient_is_bare_digits() {
        assert_eq!(to_cloud_recipient("+52 55 1234 5678").unwrap(), "525512345678");
        assert_eq!(to_cloud_recipient("200@c.us").unwrap(), "200");
        assert!(to_cloud_recipient("nobody@broadcast").is_err());
    }

    #[test]
    fn test_payload_serde_tag() {
        let payload = OutboundPayload::Buttons {
            body: "pick one".to_string(),
            buttons: vec![ButtonSpec {
                id: "yes".to_string(),
                title: "Yes".to_string(),
            }],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "buttons");

        let back: OutboundPayload = serde_json::from_value(json).unwrap();
        assert!(matches!(back, OutboundPayload::Buttons { .. }));
    }
}
