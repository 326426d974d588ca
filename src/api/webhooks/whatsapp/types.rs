//! Cloud API webhook envelope types
//!
//! Strict serde shapes for the graph webhook payload. Messages and statuses
//! can co-occur inside one change value and are handled independently.

use serde::Deserialize;

/// Top-level webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Change {
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
    #[serde(default)]
    pub statuses: Vec<WebhookStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Contact {
    #[serde(default)]
    pub wa_id: Option<String>,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

/// One inbound message inside a change value
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    pub id: String,
    pub from: String,
    /// Unix seconds as a decimal string
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub image: Option<MediaBody>,
    #[serde(default)]
    pub video: Option<MediaBody>,
    #[serde(default)]
    pub audio: Option<MediaBody>,
    #[serde(default)]
    pub document: Option<MediaBody>,
    #[serde(default)]
    pub sticker: Option<MediaBody>,
    #[serde(default)]
    pub location: Option<LocationBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextBody {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaBody {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationBody {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

/// One delivery-status update inside a change value
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookStatus {
    /// Provider id of the message the status refers to
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_payload() {
        let raw = r#"{
            "object": "whatsapp_business_account",
            "entry": [{ "id": "wba-1", "changes": [{ "field": "messages", "value": {
                "metadata": { "display_phone_number": "15550001", "phone_number_id": "pnid-1" },
                "contacts": [{ "wa_id": "5215512345678", "profile": { "name": "Ana" } }],
                "messages": [{
                    "id": "wamid.X",
                    "from": "5215512345678",
                    "timestamp": "1700000000",
                    "type": "text",
                    "text": { "body": "hola" }
                }]
            }}]}]
        }"#;

        let envelope: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.object, "whatsapp_business_account");
        let value = &envelope.entry[0].changes[0].value;
        assert_eq!(value.metadata.as_ref().unwrap().phone_number_id, "pnid-1");
        assert_eq!(value.messages[0].text.as_ref().unwrap().body, "hola");
        assert!(value.statuses.is_empty());
    }

    #[test]
    fn test_parse_status_payload() {
        let raw = r#"{
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pnid-1" },
                "statuses": [{
                    "id": "wamid.X",
                    "status": "failed",
                    "timestamp": "1700000000",
                    "errors": [{ "code": 131047, "title": "Re-engagement" }]
                }]
            }}]}]
        }"#;

        let envelope: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        let status = &envelope.entry[0].changes[0].value.statuses[0];
        assert_eq!(status.status, "failed");
        assert_eq!(status.errors[0].code, Some(131_047));
    }
}
