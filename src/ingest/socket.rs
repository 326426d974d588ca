//! Socket-session envelope canonicalization
//!
//! The transport hands over deframed provider envelopes with the nested
//! message JSON still in its native shape. Ephemeral and view-once wrappers
//! are unwrapped to a bounded depth before classification.

use chrono::{TimeZone, Utc};
use serde::Deserialize;

use super::canonical::{
    is_broadcast_peer, DeliveryMode, Direction, MediaRef, MessageEvent, MessageKind,
};

/// Wrapper unwrap bound; deeper nesting degrades to unsupported text
const MAX_UNWRAP_DEPTH: usize = 4;

const WRAPPER_KEYS: [&str; 3] = ["ephemeralMessage", "viewOnceMessage", "viewOnceMessageV2"];

/// A deframed socket envelope
#[derive(Debug, Clone, Deserialize)]
pub struct SocketEnvelope {
    pub key: EnvelopeKey,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds asserted by the provider
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    /// Provider-native nested message JSON
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Envelope routing key
#[derive(Debug, Clone, Deserialize)]
pub struct EnvelopeKey {
    pub id: String,
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
}

/// Canonicalize a socket envelope
///
/// Returns `None` for broadcast/system peers and envelopes with no usable
/// content key.
#[must_use]
pub fn canonicalize(envelope: &SocketEnvelope, mode: DeliveryMode) -> Option<MessageEvent> {
    if is_broadcast_peer(&envelope.key.remote_jid) {
        tracing::debug!(peer = %envelope.key.remote_jid, "ignoring broadcast peer");
        return None;
    }

    let inner = unwrap_content(&envelope.content);
    let (kind, text, media_mime, media_filename, latitude, longitude) = classify(inner)?;

    let timestamp = envelope
        .message_timestamp
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    let media = kind.has_media().then(|| MediaRef::SocketContent(inner.clone()));

    Some(MessageEvent {
        provider_message_id: envelope.key.id.clone(),
        peer: envelope.key.remote_jid.clone(),
        contact_name: envelope.push_name.clone(),
        direction: if envelope.key.from_me {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        kind,
        text,
        media,
        media_mime,
        media_filename,
        latitude,
        longitude,
        timestamp,
        mode,
    })
}

/// Peel ephemeral/view-once wrappers, bounded to `MAX_UNWRAP_DEPTH`
fn unwrap_content(content: &serde_json::Value) -> &serde_json::Value {
    let mut current = content;
    for _ in 0..MAX_UNWRAP_DEPTH {
        let Some(wrapped) = WRAPPER_KEYS
            .iter()
            .find_map(|key| current.get(key).and_then(|w| w.get("message")))
        else {
            return current;
        };
        current = wrapped;
    }
    current
}

type Classified = (
    MessageKind,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
);

#[allow(clippy::too_many_lines)]
fn classify(inner: &serde_json::Value) -> Option<Classified> {
    let str_at = |v: &serde_json::Value, key: &str| {
        v.get(key).and_then(serde_json::Value::as_str).map(str::to_string)
    };

    if let Some(text) = inner.get("conversation").and_then(serde_json::Value::as_str) {
        return Some((MessageKind::Text, Some(text.to_string()), None, None, None, None));
    }

    if let Some(ext) = inner.get("extendedTextMessage") {
        let text = str_at(ext, "text").unwrap_or_default();
        return Some((MessageKind::Text, Some(text), None, None, None, None));
    }

    if let Some(image) = inner.get("imageMessage") {
        return Some((
            MessageKind::Image,
            str_at(image, "caption"),
            str_at(image, "mimetype"),
            None,
            None,
            None,
        ));
    }

    if let Some(video) = inner.get("videoMessage") {
        return Some((
            MessageKind::Video,
            str_at(video, "caption"),
            str_at(video, "mimetype"),
            None,
            None,
            None,
        ));
    }

    if let Some(audio) = inner.get("audioMessage") {
        return Some((
            MessageKind::Audio,
            None,
            str_at(audio, "mimetype"),
            None,
            None,
            None,
        ));
    }

    if let Some(doc) = inner.get("documentMessage") {
        return Some((
            MessageKind::Document,
            str_at(doc, "caption"),
            str_at(doc, "mimetype"),
            str_at(doc, "fileName"),
            None,
            None,
        ));
    }

    if let Some(sticker) = inner.get("stickerMessage") {
        return Some((
            MessageKind::Sticker,
            None,
            str_at(sticker, "mimetype"),
            None,
            None,
            None,
        ));
    }

    if let Some(location) = inner.get("locationMessage") {
        return Some((
            MessageKind::Location,
            str_at(location, "name"),
            None,
            None,
            location.get("degreesLatitude").and_then(serde_json::Value::as_f64),
            location.get("degreesLongitude").and_then(serde_json::Value::as_f64),
        ));
    }

    // Unknown content key: degrade to an unsupported-text placeholder so the
    // conversation still surfaces the message
    let type_name = inner
        .as_object()
        .and_then(|o| o.keys().next())
        .cloned();
    match type_name {
        Some(name) => Some((
            MessageKind::Text,
            Some(format!("[unsupported message: {name}]")),
            None,
            None,
            None,
            None,
        )),
        None => None,
    }
}
