//! Canonical message model shared by both channel adapters
//!
//! Every inbound provider event is normalized into a `CanonicalEvent` before
//! it touches the resolver or the store, so the rest of the pipeline never
//! sees provider-specific shapes.

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// How a conversation is connected to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Official Cloud API (webhook-based)
    Api,
    /// Unofficial multi-device socket session
    Qr,
}

impl ConnectionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Qr => "qr",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "api" => Some(Self::Api),
            "qr" => Some(Self::Qr),
            _ => None,
        }
    }
}

/// Message direction relative to the tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// Canonical message content kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
            Self::Location => "location",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" => Some(Self::Document),
            "sticker" => Some(Self::Sticker),
            "location" => Some(Self::Location),
            _ => None,
        }
    }

    /// Whether this kind carries a media payload
    #[must_use]
    pub const fn has_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Sticker
        )
    }
}

/// Provider-reported delivery status of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// How a message arrived
///
/// `Notify` is a fresh message (bump unread, reopen tickets); `Append` is a
/// history backfill (timestamps only move forward, no unread changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Notify,
    Append,
}

/// Reference to media that has not been fetched yet
#[derive(Debug, Clone)]
pub enum MediaRef {
    /// Cloud media id; resolved via the two-step graph fetch
    CloudId(String),
    /// Socket envelope content; the transport decrypts and streams it
    SocketContent(serde_json::Value),
}

/// A normalized inbound or backfilled message
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Provider-assigned message id (wamid / socket key id)
    pub provider_message_id: String,
    /// Raw peer identifier (phone or jid), before normalization
    pub peer: String,
    /// Contact display name, when the provider sent one
    pub contact_name: Option<String>,
    pub direction: Direction,
    pub kind: MessageKind,
    /// Text body or media caption
    pub text: Option<String>,
    pub media: Option<MediaRef>,
    /// Provider-supplied media metadata, when present
    pub media_mime: Option<String>,
    pub media_filename: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Provider-asserted timestamp
    pub timestamp: DateTime<Utc>,
    pub mode: DeliveryMode,
}

/// A delivery status update for a previously sent message
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// A normalized provider event
#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    Message(MessageEvent),
    Status(StatusEvent),
}

/// Normalize a raw peer identifier to E.164-ish form
///
/// Strips any `@...` jid suffix, keeps only digits, and prefixes `+`.
///
/// # Errors
///
/// Returns error if no digits remain; a lead can never be keyed on an
/// empty phone.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let bare = raw.split('@').next().unwrap_or(raw);
    let digits: String = bare.chars().filter(char::is_ascii_digit).collect();

    if digits.is_empty() {
        return Err(Error::Ingest(format!("peer has no phone digits: {raw}")));
    }

    Ok(format!("+{digits}"))
}

/// Whether a peer is a broadcast or system identity that never maps to a lead
#[must_use]
pub fn is_broadcast_peer(peer: &str) -> bool {
    peer == "status@broadcast" || peer.ends_with("@broadcast") || peer.ends_with("@lid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone_strips_jid_suffix() {
        assert_eq!(normalize_phone("5215512345678@s.whatsapp.net").unwrap(), "+5215512345678");
    }

    #[test]
    fn test_normalize_phone_keeps_digits_only() {
        assert_eq!(normalize_phone("+52 (55) 1234-5678").unwrap(), "+525512345678");
        assert_eq!(normalize_phone("15551234567").unwrap(), "+15551234567");
    }

    #[test]
    fn test_normalize_phone_rejects_empty() {
        assert!(normalize_phone("").is_err());
        assert!(normalize_phone("abc@s.whatsapp.net").is_err());
    }

    #[test]
    fn test_broadcast_peers() {
        assert!(is_broadcast_peer("status@broadcast"));
        assert!(is_broadcast_peer("123456@lid"));
        assert!(!is_broadcast_peer("5215512345678@s.whatsapp.net"));
    }

    #[test]
    fn test_enum_round_trips() {
        assert_eq!(ConnectionType::parse("qr"), Some(ConnectionType::Qr));
        assert_eq!(MessageKind::parse(MessageKind::Sticker.as_str()), Some(MessageKind::Sticker));
        assert_eq!(DeliveryStatus::parse("read"), Some(DeliveryStatus::Read));
        assert_eq!(Direction::parse("bogus"), None);
    }
}
