//! Ingestion pipeline
//!
//! Takes canonical events from either adapter and runs them through dedup,
//! resolution, media fetch, persistence, and fan-out. Each event is isolated:
//! one failing message never blocks its siblings in the same delivery.

pub mod canonical;
pub mod resolver;
pub mod socket;

use std::sync::Arc;

use chrono::Utc;

use crate::channels::{CloudClient, SocketTransport};
use crate::db::{DbPool, MessageRecord, MessageRepo, NewMessage, NumberRepo};
use crate::fanout::{conversation_room, Backbone, Event};
use crate::media::{CloudMediaClient, MediaStore};
use crate::{Error, Result};

use canonical::{
    CanonicalEvent, ConnectionType, DeliveryMode, Direction, MediaRef, MessageEvent, StatusEvent,
};
use resolver::Resolver;

/// Routing identity a provider event was received under
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub tenant_id: i64,
    pub whatsapp_number_id: i64,
    pub connection_type: ConnectionType,
    /// Cloud API credentials, when the number has them
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
}

/// Ingestion pipeline
pub struct IngestPipeline {
    resolver: Resolver,
    messages: MessageRepo,
    numbers: NumberRepo,
    media: CloudMediaClient,
    store: Arc<dyn MediaStore>,
    hub: Arc<dyn Backbone>,
    transport: Option<Arc<dyn SocketTransport>>,
    cloud: CloudClient,
    /// Download media for backfilled messages too
    fetch_on_append: bool,
    /// Send read receipts for fresh inbound cloud messages
    mark_read: bool,
}

impl IngestPipeline {
    /// Assemble the pipeline over the shared pool
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        pool: DbPool,
        media: CloudMediaClient,
        store: Arc<dyn MediaStore>,
        hub: Arc<dyn Backbone>,
        transport: Option<Arc<dyn SocketTransport>>,
        cloud: CloudClient,
        fetch_on_append: bool,
        mark_read: bool,
    ) -> Self {
        Self {
            resolver: Resolver::new(pool.clone()),
            messages: MessageRepo::new(pool.clone()),
            numbers: NumberRepo::new(pool),
            media,
            store,
            hub,
            transport,
            cloud,
            fetch_on_append,
            mark_read,
        }
    }

    /// Process one canonical event
    ///
    /// # Errors
    ///
    /// Returns error if resolution or persistence fails; callers log and
    /// continue with the next event.
    pub async fn handle_event(&self, route: &RouteContext, event: CanonicalEvent) -> Result<()> {
        match event {
            CanonicalEvent::Message(message) => self.handle_message(route, message).await,
            CanonicalEvent::Status(status) => self.handle_status(route, &status),
        }
    }

    async fn handle_message(&self, route: &RouteContext, event: MessageEvent) -> Result<()> {
        // Idempotency probe before any side effects; the unique index on
        // insert is the authoritative barrier for races
        if self.messages.exists(
            route.tenant_id,
            route.whatsapp_number_id,
            route.connection_type,
            &event.provider_message_id,
        )? {
            tracing::debug!(
                provider_message_id = %event.provider_message_id,
                "duplicate delivery, skipping"
            );
            return Ok(());
        }

        let resolution = self.resolver.resolve(
            route.tenant_id,
            route.whatsapp_number_id,
            route.connection_type,
            &event,
        )?;

        let (media_url, media_mime, media_filename, content) =
            self.fetch_media(route, &event).await;

        let new = NewMessage {
            tenant_id: route.tenant_id,
            conversation_id: resolution.conversation_id,
            whatsapp_number_id: route.whatsapp_number_id,
            connection_type: route.connection_type,
            provider_message_id: event.provider_message_id.clone(),
            direction: event.direction,
            kind: event.kind,
            content,
            media_url,
            media_mime,
            media_filename,
            latitude: event.latitude,
            longitude: event.longitude,
            sent_at: event.timestamp,
        };

        let Some(record) = self.messages.insert(&new)? else {
            // Lost the insert race to a concurrent delivery
            tracing::debug!(
                provider_message_id = %event.provider_message_id,
                "concurrent duplicate, skipping"
            );
            return Ok(());
        };

        self.emit_new(route.tenant_id, &record);

        if self.mark_read
            && route.connection_type == ConnectionType::Api
            && event.direction == Direction::Inbound
            && event.mode == DeliveryMode::Notify
        {
            self.send_read_receipt(route, &event.provider_message_id).await;
        }

        tracing::info!(
            conversation_id = resolution.conversation_id,
            kind = event.kind.as_str(),
            direction = event.direction.as_str(),
            "message ingested"
        );
        Ok(())
    }

    fn handle_status(&self, route: &RouteContext, status: &StatusEvent) -> Result<()> {
        let updated = self.messages.update_status(
            route.tenant_id,
            route.whatsapp_number_id,
            route.connection_type,
            &status.provider_message_id,
            status.status,
            status.timestamp,
            status.error.as_deref(),
        )?;

        let Some(record) = updated else {
            // Status for a message we never stored; dropped, never retried
            tracing::warn!(
                provider_message_id = %status.provider_message_id,
                status = status.status.as_str(),
                "status event for unknown message, dropping"
            );
            return Ok(());
        };

        self.hub.publish(
            &conversation_room(route.tenant_id, record.conversation_id),
            Event::MessageStatus {
                conversation_id: record.conversation_id,
                message_id: record.id,
                status: status.status.as_str().to_string(),
                error: status.error.clone(),
            },
        );

        Ok(())
    }

    /// Fetch and store media, degrading to a placeholder on any failure
    ///
    /// Returns `(media_url, media_mime, media_filename, content)`.
    async fn fetch_media(
        &self,
        route: &RouteContext,
        event: &MessageEvent,
    ) -> (Option<String>, Option<String>, Option<String>, Option<String>) {
        let mut content = event.text.clone();

        let Some(media) = &event.media else {
            return (None, None, None, content);
        };

        // Backfill media is fetched only when configured
        if event.mode == DeliveryMode::Append && !self.fetch_on_append {
            return (None, event.media_mime.clone(), event.media_filename.clone(), content);
        }

        let fetched = match media {
            MediaRef::CloudId(media_id) => match route.access_token.as_deref() {
                Some(token) => self
                    .media
                    .fetch_or_warn(media_id, token)
                    .await
                    .map(|m| (m.bytes, m.mime, m.filename)),
                None => {
                    tracing::warn!(media_id, "no access token for cloud media fetch");
                    None
                }
            },
            MediaRef::SocketContent(inner) => match &self.transport {
                Some(transport) => {
                    match transport.fetch_media(route.whatsapp_number_id, inner).await {
                        Ok(bytes) => {
                            Some((bytes, event.media_mime.clone(), event.media_filename.clone()))
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "socket media fetch failed");
                            None
                        }
                    }
                }
                None => None,
            },
        };

        let Some((bytes, mime, filename)) = fetched else {
            if content.is_none() {
                if let MediaRef::CloudId(media_id) = media {
                    content = Some(format!("[media {media_id}]"));
                }
            }
            return (None, event.media_mime.clone(), event.media_filename.clone(), content);
        };

        match self
            .store
            .save(&bytes, filename.as_deref(), mime.as_deref())
            .await
        {
            Ok(url) => (Some(url), mime, filename, content),
            Err(e) => {
                tracing::warn!(error = %e, "media store failed, keeping placeholder");
                (None, mime, filename, content)
            }
        }
    }

    fn emit_new(&self, tenant_id: i64, record: &MessageRecord) {
        self.hub.publish(
            &conversation_room(tenant_id, record.conversation_id),
            Event::MessageNew {
                conversation_id: record.conversation_id,
                message_id: record.id.clone(),
                direction: record.direction.as_str().to_string(),
                kind: record.kind.as_str().to_string(),
                content: record.content.clone(),
                media_url: record.media_url.clone(),
                sent_at: record.sent_at.to_rfc3339(),
            },
        );
    }

    async fn send_read_receipt(&self, route: &RouteContext, provider_message_id: &str) {
        let (Some(phone_number_id), Some(token)) =
            (route.phone_number_id.as_deref(), route.access_token.as_deref())
        else {
            return;
        };

        if let Err(e) = self
            .cloud
            .mark_read(phone_number_id, token, provider_message_id)
            .await
        {
            tracing::warn!(error = %e, "read receipt failed");
        }
    }

    /// Resolve the routing identity for a socket session id
    ///
    /// The transport only knows its session id; this maps it back to the
    /// owning tenant and number through the connections table. `None` means
    /// the session is not provisioned and its envelopes must be dropped.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn route_for_session(&self, session_id: &str) -> Result<Option<RouteContext>> {
        let Some(connection) = self
            .numbers
            .find_connection(ConnectionType::Qr, session_id)?
        else {
            tracing::warn!(session_id, "socket envelope for unknown session, dropping");
            return Ok(None);
        };

        let number = self
            .numbers
            .find(connection.whatsapp_number_id)?
            .ok_or_else(|| {
                Error::Ingest(format!(
                    "connection {} points at missing number {}",
                    connection.id, connection.whatsapp_number_id
                ))
            })?;

        Ok(Some(RouteContext {
            tenant_id: connection.tenant_id,
            whatsapp_number_id: number.id,
            connection_type: ConnectionType::Qr,
            phone_number_id: number.phone_number_id,
            access_token: number.access_token,
        }))
    }

    /// Canonicalize and ingest one socket envelope
    ///
    /// Broadcast peers and empty envelopes are dropped silently.
    ///
    /// # Errors
    ///
    /// Returns error if ingestion of a canonicalized event fails
    pub async fn handle_socket_envelope(
        &self,
        route: &RouteContext,
        envelope: &socket::SocketEnvelope,
        mode: DeliveryMode,
    ) -> Result<()> {
        let Some(event) = socket::canonicalize(envelope, mode) else {
            return Ok(());
        };
        self.handle_event(route, CanonicalEvent::Message(event)).await
    }

    /// Ingest a socket delivery-status update
    ///
    /// # Errors
    ///
    /// Returns error if the status update fails to persist
    pub fn handle_socket_status(&self, route: &RouteContext, status: StatusEvent) -> Result<()> {
        self.handle_status(route, &status)
    }
}

/// Build a status event from provider fields
///
/// # Errors
///
/// Returns error if the status string is not a known delivery status
pub fn status_event(
    provider_message_id: &str,
    status: &str,
    timestamp: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
) -> Result<StatusEvent> {
    let parsed = canonical::DeliveryStatus::parse(status)
        .ok_or_else(|| Error::Ingest(format!("unknown delivery status: {status}")))?;

    Ok(StatusEvent {
        provider_message_id: provider_message_id.to_string(),
        status: parsed,
        timestamp: timestamp.unwrap_or_else(Utc::now),
        error,
    })
}
