//! Cloud API webhook handler
//!
//! GET is the subscription handshake; POST carries message and status
//! events. Posts are authenticated with `X-Hub-Signature-256` over the raw
//! body before any parsing. The response returns 200 quickly and the actual
//! processing runs in a spawned task.

pub mod types;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use self::types::{ChangeValue, WebhookEnvelope, WebhookMessage};
use crate::api::ApiState;
use crate::ingest::canonical::{
    CanonicalEvent, ConnectionType, DeliveryMode, Direction, MediaRef, MessageEvent, MessageKind,
};
use crate::ingest::{status_event, RouteContext};

/// GET handshake query parameters
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Handle the webhook subscription handshake
///
/// Echoes `hub.challenge` when the verify token matches, 403 otherwise.
pub async fn verify(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<VerifyQuery>,
) -> (StatusCode, String) {
    let expected = state.config.cloud.verify_token.as_deref();

    let token_matches = query.mode.as_deref() == Some("subscribe")
        && expected.is_some()
        && query.verify_token.as_deref() == expected;

    if token_matches {
        if let Some(challenge) = query.challenge {
            tracing::info!("webhook subscription verified");
            return (StatusCode::OK, challenge);
        }
    }

    tracing::warn!("webhook verification rejected");
    (StatusCode::FORBIDDEN, String::new())
}

/// Handle an incoming webhook post
///
/// Bad or missing signatures are rejected with 403 before any side effects.
pub async fn receive(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = state.config.cloud.app_secret.as_deref() {
        let provided = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok());

        if !signature_valid(secret, provided, &body) {
            tracing::warn!("webhook signature mismatch");
            return StatusCode::FORBIDDEN;
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable webhook payload");
            // Acknowledge anyway; the provider would retry forever otherwise
            return StatusCode::OK;
        }
    };

    tokio::spawn(async move {
        process_envelope(state, envelope).await;
    });

    StatusCode::OK
}

/// Check `X-Hub-Signature-256` against the raw body, constant-time
fn signature_valid(secret: &str, provided: Option<&str>, body: &[u8]) -> bool {
    let Some(header) = provided else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Walk every change value, routing by the metadata phone number id
async fn process_envelope(state: Arc<ApiState>, envelope: WebhookEnvelope) {
    if envelope.object != "whatsapp_business_account" {
        tracing::debug!(object = %envelope.object, "ignoring non-account webhook object");
        return;
    }

    for entry in envelope.entry {
        for change in entry.changes {
            process_change_value(&state, change.value).await;
        }
    }
}

async fn process_change_value(state: &Arc<ApiState>, value: ChangeValue) {
    let Some(metadata) = value.metadata else {
        tracing::warn!("webhook change without metadata, dropping");
        return;
    };

    let number = match state.numbers.find_by_phone_number_id(&metadata.phone_number_id) {
        Ok(Some(number)) => number,
        Ok(None) => {
            tracing::warn!(
                phone_number_id = %metadata.phone_number_id,
                "webhook for unknown number, dropping"
            );
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "number lookup failed");
            return;
        }
    };

    let route = RouteContext {
        tenant_id: number.tenant_id,
        whatsapp_number_id: number.id,
        connection_type: ConnectionType::Api,
        phone_number_id: number.phone_number_id.clone(),
        access_token: number.access_token.clone(),
    };

    // Contact names are delivered alongside, keyed by wa_id
    let contact_name = |from: &str| {
        value
            .contacts
            .iter()
            .find(|c| c.wa_id.as_deref() == Some(from))
            .and_then(|c| c.profile.as_ref())
            .and_then(|p| p.name.clone())
    };

    // Messages and statuses are independent; one failure never stops the rest
    for message in &value.messages {
        let event = canonicalize_message(message, contact_name(&message.from));
        if let Err(e) = state
            .pipeline
            .handle_event(&route, CanonicalEvent::Message(event))
            .await
        {
            tracing::error!(
                provider_message_id = %message.id,
                error = %e,
                "message ingestion failed"
            );
        }
    }

    for status in &value.statuses {
        let error_text = status
            .errors
            .first()
            .map(|e| e.title.clone().or_else(|| e.message.clone()).unwrap_or_default());

        let event = match status_event(
            &status.id,
            &status.status,
            parse_unix_seconds(status.timestamp.as_deref()),
            error_text,
        ) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable status event, dropping");
                continue;
            }
        };

        if let Err(e) = state
            .pipeline
            .handle_event(&route, CanonicalEvent::Status(event))
            .await
        {
            tracing::error!(provider_message_id = %status.id, error = %e, "status update failed");
        }
    }
}

/// Map a webhook message into the canonical model
fn canonicalize_message(message: &WebhookMessage, contact_name: Option<String>) -> MessageEvent {
    let timestamp = parse_unix_seconds(message.timestamp.as_deref()).unwrap_or_else(Utc::now);

    let (kind, text, media, media_mime, media_filename, latitude, longitude) =
        classify(message);

    MessageEvent {
        provider_message_id: message.id.clone(),
        peer: message.from.clone(),
        contact_name,
        direction: Direction::Inbound,
        kind,
        text,
        media,
        media_mime,
        media_filename,
        latitude,
        longitude,
        timestamp,
        mode: DeliveryMode::Notify,
    }
}

type ClassifiedMessage = (
    MessageKind,
    Option<String>,
    Option<MediaRef>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
);

fn classify(message: &WebhookMessage) -> ClassifiedMessage {
    let media_parts = |kind: MessageKind, body: &types::MediaBody| {
        (
            kind,
            body.caption.clone(),
            Some(MediaRef::CloudId(body.id.clone())),
            body.mime_type.clone(),
            body.filename.clone(),
            None,
            None,
        )
    };

    let unsupported = |name: &str| {
        (
            MessageKind::Text,
            Some(format!("[unsupported message: {name}]")),
            None,
            None,
            None,
            None,
            None,
        )
    };

    match (message.message_type.as_str(), message) {
        ("text", _) => (
            MessageKind::Text,
            message.text.as_ref().map(|t| t.body.clone()),
            None,
            None,
            None,
            None,
            None,
        ),
        ("image", WebhookMessage { image: Some(body), .. }) => {
            media_parts(MessageKind::Image, body)
        }
        ("video", WebhookMessage { video: Some(body), .. }) => {
            media_parts(MessageKind::Video, body)
        }
        ("audio", WebhookMessage { audio: Some(body), .. }) => {
            media_parts(MessageKind::Audio, body)
        }
        ("document", WebhookMessage { document: Some(body), .. }) => {
            media_parts(MessageKind::Document, body)
        }
        ("sticker", WebhookMessage { sticker: Some(body), .. }) => {
            media_parts(MessageKind::Sticker, body)
        }
        ("location", WebhookMessage { location: Some(location), .. }) => (
            MessageKind::Location,
            location.name.clone(),
            None,
            None,
            None,
            Some(location.latitude),
            Some(location.longitude),
        ),
        (other, _) => unsupported(other),
    }
}

fn parse_unix_seconds(raw: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_signature_accepts_valid() {
        let body = b"{\"object\":\"whatsapp_business_account\"}";
        let header = signed("top-secret", body);
        assert!(signature_valid("top-secret", Some(&header), body));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let body = b"{\"object\":\"whatsapp_business_account\"}";
        let header = signed("top-secret", body);

        assert!(!signature_valid("top-secret", Some(&header), b"{\"object\":\"evil\"}"));
        assert!(!signature_valid("other-secret", Some(&header), body));
        assert!(!signature_valid("top-secret", None, body));
        assert!(!signature_valid("top-secret", Some("sha256=zz"), body));
        assert!(!signature_valid("top-secret", Some("md5=abc"), body));
    }

    #[test]
    fn test_classify_text() {
        let message: WebhookMessage = serde_json::from_value(serde_json::json!({
            "id": "wamid.1", "from": "521", "type": "text", "text": {"body": "hola"}
        }))
        .unwrap();
        let event = canonicalize_message(&message, Some("Ana".to_string()));
        assert_eq!(event.kind, MessageKind::Text);
        assert_eq!(event.text.as_deref(), Some("hola"));
        assert_eq!(event.mode, DeliveryMode::Notify);
        assert_eq!(event.contact_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn test_classify_document_keeps_filename() {
        let message: WebhookMessage = serde_json::from_value(serde_json::json!({
            "id": "wamid.2", "from": "521", "type": "document",
            "document": {"id": "media-9", "mime_type": "application/pdf",
                         "filename": "quote.pdf", "caption": "here"}
        }))
        .unwrap();
        let event = canonicalize_message(&message, None);
        assert_eq!(event.kind, MessageKind::Document);
        assert_eq!(event.media_filename.as_deref(), Some("quote.pdf"));
        assert_eq!(event.text.as_deref(), Some("here"));
        assert!(matches!(event.media, Some(MediaRef::CloudId(ref id)) if id == "media-9"));
    }

    #[test]
    fn test_classify_unknown_degrades() {
        let message: WebhookMessage = serde_json::from_value(serde_json::json!({
            "id": "wamid.3", "from": "521", "type": "reaction"
        }))
        .unwrap();
        let event = canonicalize_message(&message, None);
        assert_eq!(event.kind, MessageKind::Text);
        assert_eq!(event.text.as_deref(), Some("[unsupported message: reaction]"));
    }
}
