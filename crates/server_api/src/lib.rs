use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use push::{PushDispatcher, TokenCleanup};
use shared::{
    domain::Username,
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use storage::Storage;

pub mod gate;
pub mod presence;
pub mod router;

pub use gate::{admit, AdmitDecision};
pub use presence::{LiveHandle, PresenceRegistry};
pub use router::{deliver, DeliveryOutcome};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: Arc<PresenceRegistry>,
    pub push: PushDispatcher,
}

impl ApiContext {
    pub fn new(storage: Storage, push: PushDispatcher) -> Self {
        Self {
            storage,
            presence: Arc::new(PresenceRegistry::new()),
            push,
        }
    }
}

/// Full send pipeline: relationship gate, then delivery routing. Always
/// resolves to a `YoSent` event for the sender; authorization denials and
/// unreachable recipients are expected outcomes, not errors.
pub async fn send_yo(
    ctx: &ApiContext,
    sender: &Username,
    recipient: &Username,
) -> Result<ServerEvent, ApiError> {
    let decision = gate::admit(&ctx.storage, sender, recipient)
        .await
        .map_err(internal)?;

    if let AdmitDecision::Deny(reason) = decision {
        return Ok(ServerEvent::YoSent {
            to: recipient.clone(),
            success: false,
            reason: Some(reason.as_str().to_string()),
        });
    }

    let outcome = router::deliver(ctx, sender, recipient)
        .await
        .map_err(internal)?;

    Ok(ServerEvent::YoSent {
        to: recipient.clone(),
        success: outcome.is_success(),
        reason: outcome.failure_reason().map(str::to_string),
    })
}

/// Passes a friend-added side event through to the recipient's live handle,
/// if any. Fire-and-forget; an offline recipient simply misses it.
pub fn notify_friend_added(ctx: &ApiContext, from: &Username, to: &Username) {
    if let Some(handle) = ctx.presence.lookup(to) {
        handle.emit(ServerEvent::FriendAdded {
            from: from.clone(),
            timestamp: Utc::now(),
        });
        debug!(%from, %to, "friend_added event delivered live");
    }
}

/// Token cleanup hook wired into the push dispatcher's receipt path.
#[derive(Clone)]
pub struct StorageTokenCleanup(pub Storage);

#[async_trait]
impl TokenCleanup for StorageTokenCleanup {
    async fn clear_token(&self, username: &Username) -> anyhow::Result<()> {
        self.0.clear_delivery_token(username).await
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
