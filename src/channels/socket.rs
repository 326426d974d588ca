//! Socket-session channel
//!
//! The multi-device socket protocol itself lives outside this crate; it is
//! consumed through the `SocketTransport` trait. The registry tracks which
//! numbers have a live session and who is typing, with typing state expiring
//! on its own.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::OutboundPayload;
use crate::Result;

/// Typing indications older than this are treated as stopped
const TYPING_TTL: Duration = Duration::from_secs(10);

/// Transport seam for the unofficial socket protocol
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Send a payload over the number's live session, returning the
    /// provider message id
    async fn send(&self, number_id: i64, jid: &str, payload: &OutboundPayload) -> Result<String>;

    /// Drain the decrypted media stream for an envelope into one buffer
    async fn fetch_media(&self, number_id: i64, content: &serde_json::Value) -> Result<Vec<u8>>;

    /// Whether the number currently has a live session
    fn is_connected(&self, number_id: i64) -> bool;
}

#[derive(Debug, Default)]
struct SessionState {
    status: String,
    /// jid -> last typing indication
    typing: HashMap<String, Instant>,
}

/// Live socket session registry, keyed by number id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, SessionState>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session status change ("connected", "disconnected", ...)
    pub fn set_status(&self, number_id: i64, status: &str) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.entry(number_id).or_default().status = status.to_string();
        tracing::info!(number_id, status, "socket session status");
    }

    /// Current status for a number, if any session was ever seen
    #[must_use]
    pub fn status(&self, number_id: i64) -> Option<String> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions.get(&number_id).map(|s| s.status.clone())
    }

    /// Record that a peer is typing
    pub fn set_typing(&self, number_id: i64, jid: &str) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions
            .entry(number_id)
            .or_default()
            .typing
            .insert(jid.to_string(), Instant::now());
    }

    /// Peers with a fresh typing indication on the number's session
    ///
    /// Expired entries are dropped on the way out.
    #[must_use]
    pub fn typing_peers(&self, number_id: i64) -> Vec<String> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(state) = sessions.get_mut(&number_id) else {
            return Vec::new();
        };
        state.typing.retain(|_, at| at.elapsed() < TYPING_TTL);
        let mut peers: Vec<String> = state.typing.keys().cloned().collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tracking() {
        let registry = SessionRegistry::new();
        assert!(registry.status(1).is_none());

        registry.set_status(1, "connected");
        assert_eq!(registry.status(1).as_deref(), Some("connected"));

        registry.set_status(1, "disconnected");
        assert_eq!(registry.status(1).as_deref(), Some("disconnected"));
    }

    #[test]
    fn test_typing_is_per_number() {
        let registry = SessionRegistry::new();
        registry.set_typing(1, "200@c.us");
        registry.set_typing(1, "300@c.us");

        assert_eq!(registry.typing_peers(1), vec!["200@c.us", "300@c.us"]);
        assert!(registry.typing_peers(2).is_empty());
    }
}
