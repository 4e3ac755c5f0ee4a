//! Relationship gate: decides whether a send is admitted at all.

use anyhow::Result;
use tracing::debug;

use shared::{domain::Username, error::DenyReason};
use storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allow,
    Deny(DenyReason),
}

impl AdmitDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, AdmitDecision::Allow)
    }
}

/// Checks run in order, short-circuiting on the first failure:
/// the recipient must exist, the recipient must be in the *sender's own*
/// friend set, and the sender must not be in the recipient's block set.
/// The block check runs last so a block silences even a current friend
/// entry when the two lists have drifted apart, and so the sender-side UI
/// can distinguish "not friends" from "blocked".
pub async fn admit(
    storage: &Storage,
    sender: &Username,
    recipient: &Username,
) -> Result<AdmitDecision> {
    if storage.find_user(recipient).await?.is_none() {
        debug!(%sender, %recipient, "send denied: unknown recipient");
        return Ok(AdmitDecision::Deny(DenyReason::UnknownRecipient));
    }

    if !storage.is_friend(sender, recipient).await? {
        debug!(%sender, %recipient, "send denied: not friends");
        return Ok(AdmitDecision::Deny(DenyReason::NotFriends));
    }

    if storage.has_blocked(recipient, sender).await? {
        debug!(%sender, %recipient, "send denied: blocked by recipient");
        return Ok(AdmitDecision::Deny(DenyReason::BlockedByRecipient));
    }

    Ok(AdmitDecision::Allow)
}

#[cfg(test)]
#[path = "tests/gate_tests.rs"]
mod tests;
