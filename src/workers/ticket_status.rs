//! Ticket-status worker
//!
//! Conversations whose ticket is `open` with no message in the last four
//! hours drop to `pending` in one bulk pass. The rule is purely time-based;
//! who sent the last message does not matter. Pending and closed tickets
//! are never touched here.

use chrono::{Duration, Utc};

use super::WorkerCtx;
use crate::Result;

/// Hours of silence before an open ticket goes pending
pub const STALE_AFTER_HOURS: i64 = 4;

/// One pass: demote stale open tickets, returning how many moved
///
/// # Errors
///
/// Returns error if the bulk update fails
pub fn run_once(ctx: &WorkerCtx) -> Result<usize> {
    let cutoff = Utc::now() - Duration::hours(STALE_AFTER_HOURS);
    let demoted = ctx.conversations.demote_stale_open(cutoff)?;

    if demoted > 0 {
        tracing::info!(demoted, "stale open tickets moved to pending");
    }

    Ok(demoted)
}
