//! Lead and conversation resolution
//!
//! Maps an inbound peer to its lead and conversation rows, creating them on
//! first contact, and applies the unread/ticket/timestamp transitions that
//! depend on how the message arrived.

use chrono::Utc;

use super::canonical::{normalize_phone, ConnectionType, DeliveryMode, Direction, MessageEvent};
use crate::db::{ConversationRepo, DbPool, LeadRepo};
use crate::Result;

/// Resolved target for a message
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub lead_id: i64,
    pub conversation_id: i64,
}

/// Lead/conversation resolver
#[derive(Clone)]
pub struct Resolver {
    leads: LeadRepo,
    conversations: ConversationRepo,
}

impl Resolver {
    /// Create a resolver over the shared pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            leads: LeadRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool),
        }
    }

    /// Resolve a message event to its lead and conversation
    ///
    /// Fresh inbound messages bump unread, stamp `last_message_at` with the
    /// wall clock, and reopen closed tickets. Backfilled and outbound
    /// messages only advance `last_message_at`, using the provider's
    /// timestamp, and never perturb unread counts.
    ///
    /// # Errors
    ///
    /// Returns error if the peer has no phone digits or a database
    /// operation fails
    pub fn resolve(
        &self,
        tenant_id: i64,
        whatsapp_number_id: i64,
        connection_type: ConnectionType,
        event: &MessageEvent,
    ) -> Result<Resolution> {
        let phone = normalize_phone(&event.peer)?;

        let lead = self
            .leads
            .find_or_create(tenant_id, &phone, event.contact_name.as_deref())?;

        let conversation = self.conversations.find_or_create(
            tenant_id,
            lead.id,
            whatsapp_number_id,
            connection_type,
            &event.peer,
        )?;

        let fresh_inbound =
            event.direction == Direction::Inbound && event.mode == DeliveryMode::Notify;

        if fresh_inbound {
            let now = Utc::now();
            self.conversations.record_inbound(conversation.id, now)?;
            self.leads.touch(lead.id, now, event.contact_name.as_deref())?;
        } else {
            self.conversations
                .advance_last_message_at(conversation.id, event.timestamp)?;
            self.leads
                .touch(lead.id, event.timestamp, event.contact_name.as_deref())?;
        }

        Ok(Resolution {
            lead_id: lead.id,
            conversation_id: conversation.id,
        })
    }
}
