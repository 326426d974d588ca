//! Background workers
//!
//! Each worker is a timer loop around a `run_once` pass. A tick is skipped
//! when the previous pass is still running, so a slow provider never stacks
//! concurrent passes.

pub mod queue;
pub mod reminders;
pub mod ticket_status;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{to_cloud_recipient, CloudClient, OutboundPayload, SocketTransport};
use crate::db::{
    Conversation, ConversationRepo, DbPool, MessageRepo, NumberRepo, QueueRepo, ReminderRepo,
};
use crate::fanout::EventHub;
use crate::ingest::canonical::ConnectionType;
use crate::{Error, Result};

/// Shared context handed to every worker
pub struct WorkerCtx {
    pub db: DbPool,
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
    pub reminders: ReminderRepo,
    pub queue: QueueRepo,
    pub numbers: NumberRepo,
    pub hub: Arc<EventHub>,
    pub sender: Arc<dyn OutboundSender>,
}

impl WorkerCtx {
    /// Assemble worker context over the shared pool
    #[must_use]
    pub fn new(db: DbPool, hub: Arc<EventHub>, sender: Arc<dyn OutboundSender>) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            reminders: ReminderRepo::new(db.clone()),
            queue: QueueRepo::new(db.clone()),
            numbers: NumberRepo::new(db.clone()),
            db,
            hub,
            sender,
        }
    }
}

/// Outbound delivery seam used by workers
///
/// Resolves the conversation's channel and returns the provider message id.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, conversation: &Conversation, payload: &OutboundPayload) -> Result<String>;
}

/// Production sender routing over the conversation's connection type
pub struct GatewaySender {
    cloud: CloudClient,
    numbers: NumberRepo,
    transport: Option<Arc<dyn SocketTransport>>,
}

impl GatewaySender {
    /// Create a sender over both channel adapters
    #[must_use]
    pub fn new(
        cloud: CloudClient,
        numbers: NumberRepo,
        transport: Option<Arc<dyn SocketTransport>>,
    ) -> Self {
        Self {
            cloud,
            numbers,
            transport,
        }
    }
}

#[async_trait]
impl OutboundSender for GatewaySender {
    async fn send(&self, conversation: &Conversation, payload: &OutboundPayload) -> Result<String> {
        match conversation.connection_type {
            ConnectionType::Api => {
                let number = self
                    .numbers
                    .find(conversation.whatsapp_number_id)?
                    .ok_or_else(|| {
                        Error::NotFound(format!("number {}", conversation.whatsapp_number_id))
                    })?;

                let (Some(phone_number_id), Some(token)) =
                    (number.phone_number_id.as_deref(), number.access_token.as_deref())
                else {
                    return Err(Error::Channel(format!(
                        "number {} has no cloud credentials",
                        number.id
                    )));
                };

                let to = to_cloud_recipient(&conversation.external_chat_id)?;
                self.cloud.send(phone_number_id, token, &to, payload).await
            }
            ConnectionType::Qr => {
                let transport = self
                    .transport
                    .as_ref()
                    .ok_or_else(|| Error::Channel("no socket transport configured".to_string()))?;

                if !transport.is_connected(conversation.whatsapp_number_id) {
                    return Err(Error::Channel(format!(
                        "number {} socket session is down",
                        conversation.whatsapp_number_id
                    )));
                }

                transport
                    .send(
                        conversation.whatsapp_number_id,
                        &conversation.external_chat_id,
                        payload,
                    )
                    .await
            }
        }
    }
}

/// Run a worker pass on an interval, skipping ticks while a pass is running
pub fn spawn_worker<F, Fut>(
    name: &'static str,
    period: Duration,
    ctx: Arc<WorkerCtx>,
    run: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Arc<WorkerCtx>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    tokio::spawn(async move {
        let running = Arc::new(AtomicBool::new(false));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if running.swap(true, Ordering::SeqCst) {
                tracing::debug!(worker = name, "previous pass still running, skipping tick");
                continue;
            }

            let running = Arc::clone(&running);
            let ctx = Arc::clone(&ctx);
            let run = run.clone();
            tokio::spawn(async move {
                match run(ctx).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(worker = name, processed = n, "worker pass done"),
                    Err(e) => tracing::error!(worker = name, error = %e, "worker pass failed"),
                }
                running.store(false, Ordering::SeqCst);
            });
        }
    })
}

/// Spawn all workers at their production cadence
pub fn spawn_all(ctx: Arc<WorkerCtx>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_worker(
            "reminders",
            Duration::from_secs(60),
            Arc::clone(&ctx),
            |ctx| async move { reminders::run_once(&ctx).await },
        ),
        spawn_worker(
            "ticket-status",
            Duration::from_secs(30 * 60),
            Arc::clone(&ctx),
            |ctx| async move { ticket_status::run_once(&ctx) },
        ),
        spawn_worker("queue", Duration::from_secs(2), ctx, |ctx| async move {
            queue::run_once(&ctx).await
        }),
    ]
}
