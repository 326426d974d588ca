//! Outbound queue worker
//!
//! Claims a batch of due queue items inside one transaction, then performs
//! the network sends with no lock or transaction held. Failures reschedule
//! with exponential backoff until the attempt cap.

use chrono::Utc;

use super::WorkerCtx;
use crate::channels::OutboundPayload;
use crate::db::queue::MAX_ATTEMPTS;
use crate::db::QueueItem;
use crate::fanout::{conversation_room, Backbone, Event};
use crate::ingest::canonical::DeliveryStatus;
use crate::Result;

const BATCH: usize = 10;

/// One pass: reset stale daily counters, then drain a claim batch
///
/// # Errors
///
/// Returns error only if claiming fails; per-item failures are recorded on
/// their rows.
pub async fn run_once(ctx: &WorkerCtx) -> Result<usize> {
    ctx.numbers.reset_stale_daily_counters()?;

    let items = ctx.queue.claim_due(Utc::now(), BATCH)?;
    let mut sent = 0;

    for item in items {
        match deliver(ctx, &item).await {
            Ok(()) => sent += 1,
            Err(e) => {
                let attempts = item.attempts + 1;
                tracing::warn!(
                    queue_id = item.id,
                    attempts,
                    error = %e,
                    "queued send failed"
                );
                ctx.queue.mark_failed(item.id, attempts, &e.to_string())?;
                if attempts >= MAX_ATTEMPTS {
                    tracing::error!(queue_id = item.id, "queue item abandoned after max attempts");
                }
                fail_message(ctx, &item, &e.to_string());
            }
        }
    }

    Ok(sent)
}

async fn deliver(ctx: &WorkerCtx, item: &QueueItem) -> Result<()> {
    let payload: OutboundPayload = serde_json::from_str(&item.payload)?;

    let conversation = ctx
        .conversations
        .find(item.conversation_id)?
        .ok_or_else(|| crate::Error::NotFound(format!("conversation {}", item.conversation_id)))?;

    // Network I/O happens outside any claim transaction
    ctx.sender.send(&conversation, &payload).await?;

    ctx.queue.mark_sent(item.id)?;
    ctx.numbers.record_sent(conversation.whatsapp_number_id)?;

    if let Some(message_id) = &item.message_id {
        ctx.messages
            .set_status_by_id(message_id, DeliveryStatus::Sent, None)?;
        ctx.hub.publish(
            &conversation_room(conversation.tenant_id, conversation.id),
            Event::MessageStatus {
                conversation_id: conversation.id,
                message_id: message_id.clone(),
                status: DeliveryStatus::Sent.as_str().to_string(),
                error: None,
            },
        );
    }

    Ok(())
}

fn fail_message(ctx: &WorkerCtx, item: &QueueItem, error: &str) {
    let Some(message_id) = &item.message_id else {
        return;
    };

    if let Err(e) = ctx
        .messages
        .set_status_by_id(message_id, DeliveryStatus::Failed, Some(error))
    {
        tracing::error!(message_id, error = %e, "failed to mark message failed");
    }
}
