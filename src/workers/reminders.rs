//! Reminder worker
//!
//! Sends due reminders over the conversation's channel, then chains exactly
//! one successor when the reminder recurs and the end date has not passed.

use chrono::{DateTime, Duration, Months, Utc};

use super::WorkerCtx;
use crate::channels::{ButtonSpec, OutboundPayload};
use crate::db::reminder::NewReminder;
use crate::db::Reminder;
use crate::fanout::{conversation_room, Backbone, Event};
use crate::Result;

const BATCH: usize = 50;

/// One pass: send every due reminder, isolating failures per reminder
///
/// # Errors
///
/// Returns error only if the due query itself fails; individual reminder
/// failures are recorded on their rows.
pub async fn run_once(ctx: &WorkerCtx) -> Result<usize> {
    let due = ctx.reminders.due(Utc::now(), BATCH)?;
    let mut sent = 0;

    for reminder in due {
        match deliver(ctx, &reminder).await {
            Ok(()) => {
                sent += 1;
                if let Err(e) = spawn_successor(ctx, &reminder) {
                    tracing::error!(reminder_id = reminder.id, error = %e, "recurrence failed");
                }
            }
            Err(e) => {
                tracing::warn!(reminder_id = reminder.id, error = %e, "reminder send failed");
                ctx.reminders.mark_failed(reminder.id, &e.to_string())?;
            }
        }
    }

    Ok(sent)
}

async fn deliver(ctx: &WorkerCtx, reminder: &Reminder) -> Result<()> {
    let conversation = ctx
        .conversations
        .find(reminder.conversation_id)?
        .ok_or_else(|| {
            crate::Error::NotFound(format!("conversation {}", reminder.conversation_id))
        })?;

    let payload = render(reminder);
    ctx.sender.send(&conversation, &payload).await?;
    ctx.reminders.mark_sent(reminder.id)?;

    ctx.hub.publish(
        &conversation_room(conversation.tenant_id, conversation.id),
        Event::ReminderSent {
            conversation_id: conversation.id,
            reminder_id: reminder.id,
        },
    );

    Ok(())
}

/// Render a reminder into an outbound payload
///
/// Media wins over buttons; buttons over plain text.
#[must_use]
pub fn render(reminder: &Reminder) -> OutboundPayload {
    if let Some(url) = &reminder.media_url {
        return OutboundPayload::Media {
            kind: reminder.media_kind.clone().unwrap_or_else(|| "image".to_string()),
            url: url.clone(),
            caption: Some(reminder.message.clone()),
            filename: None,
        };
    }

    if let Some(raw) = &reminder.buttons {
        if let Ok(buttons) = serde_json::from_str::<Vec<ButtonSpec>>(raw) {
            if !buttons.is_empty() {
                return OutboundPayload::Buttons {
                    body: reminder.message.clone(),
                    buttons,
                };
            }
        }
    }

    OutboundPayload::Text {
        body: reminder.message.clone(),
    }
}

/// Chain the next occurrence, at most once per reminder
fn spawn_successor(ctx: &WorkerCtx, reminder: &Reminder) -> Result<usize> {
    if reminder.recurrence == "none" {
        return Ok(0);
    }

    // A retried pass must not fork the chain
    if ctx.reminders.successor_count(reminder.id)? > 0 {
        return Ok(0);
    }

    let Some(next) = next_occurrence(reminder.scheduled_at, &reminder.recurrence) else {
        return Ok(0);
    };

    if let Some(end) = reminder.recurrence_end_at {
        if next > end {
            tracing::debug!(reminder_id = reminder.id, "recurrence reached end date");
            return Ok(0);
        }
    }

    ctx.reminders.insert(&NewReminder {
        tenant_id: reminder.tenant_id,
        conversation_id: reminder.conversation_id,
        message: reminder.message.clone(),
        media_url: reminder.media_url.clone(),
        media_kind: reminder.media_kind.clone(),
        buttons: reminder.buttons.clone(),
        scheduled_at: next,
        recurrence: reminder.recurrence.clone(),
        recurrence_end_at: reminder.recurrence_end_at,
        parent_reminder_id: Some(reminder.id),
    })?;

    Ok(1)
}

/// Next scheduled time for a recurrence rule
#[must_use]
pub fn next_occurrence(from: DateTime<Utc>, recurrence: &str) -> Option<DateTime<Utc>> {
    match recurrence {
        "daily" => Some(from + Duration::days(1)),
        "weekly" => Some(from + Duration::weeks(1)),
        "monthly" => from.checked_add_months(Months::new(1)),
        _ => None,
    }
}
