//! Delivery router: live socket, remote push, or both.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use shared::{domain::Username, error::RECIPIENT_UNREACHABLE, protocol::ServerEvent};

use crate::ApiContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub live_delivered: bool,
    pub push_attempted: bool,
    pub push_succeeded: bool,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.live_delivered || self.push_succeeded
    }

    pub fn failure_reason(&self) -> Option<&'static str> {
        if self.is_success() {
            None
        } else {
            Some(RECIPIENT_UNREACHABLE)
        }
    }
}

/// Delivers an admitted Yo. Callers must run the relationship gate first;
/// the router never re-checks relationships.
///
/// Live and push channels are deliberately not exclusive: when the recipient
/// is online *and* has a delivery token, both fire, and a duplicate
/// notification is accepted over a silent loss on a flaky live channel.
pub async fn deliver(
    ctx: &ApiContext,
    sender: &Username,
    recipient: &Username,
) -> Result<DeliveryOutcome> {
    let timestamp = Utc::now();
    // The store owns the counter; the router only forwards the
    // post-increment total.
    let total_yos = ctx.storage.record_yo(recipient, sender, timestamp).await?;

    let mut outcome = DeliveryOutcome::default();

    if let Some(handle) = ctx.presence.lookup(recipient) {
        // The handle may die between lookup and emit; push below is the
        // safety net, not an exactly-once guarantee.
        outcome.live_delivered = handle.emit(ServerEvent::YoReceived {
            from: sender.clone(),
            timestamp,
            total_yos,
        });
    }

    let token = ctx
        .storage
        .find_user(recipient)
        .await?
        .and_then(|user| user.delivery_token);

    if let Some(token) = token {
        outcome.push_attempted = true;
        let push = ctx.push.send_yo(recipient, &token, sender).await;
        outcome.push_succeeded = push.delivered;

        if push.should_remove_token {
            // Best-effort cleanup; a failure here must not fail the send.
            if let Err(error) = ctx.storage.clear_delivery_token(recipient).await {
                warn!(%recipient, %error, "failed to clear invalid delivery token");
            }
        }
    }

    debug!(
        %sender,
        %recipient,
        live = outcome.live_delivered,
        push_attempted = outcome.push_attempted,
        push_ok = outcome.push_succeeded,
        "yo routed"
    );

    Ok(outcome)
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
