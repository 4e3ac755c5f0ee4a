//! Push notification dispatch for Yo delivery.
//!
//! Wraps the remote push provider behind [`PushTransport`] and owns the
//! provider-facing semantics: token format validation, payload templating,
//! batch chunking, deferred receipt checks and invalid-token cleanup
//! signaling. The receipt check runs on its own task and never blocks or
//! fails the send path that triggered it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use shared::domain::Username;

mod transport;

pub use transport::HttpPushTransport;

/// Provider-imposed upper bound on messages per request.
pub const MAX_BATCH_SIZE: usize = 100;

/// Syntactic token check only; a well-formed token can still turn out to be
/// unregistered, which the provider reports after a send attempt.
pub fn is_valid_token_format(token: &str) -> bool {
    let body = token
        .strip_prefix("ExponentPushToken[")
        .or_else(|| token.strip_prefix("ExpoPushToken["));
    matches!(body, Some(rest) if rest.ends_with(']') && rest.len() > 1)
}

#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: YoData,
    pub sound: String,
    pub priority: String,
    pub ttl: u32,
    #[serde(rename = "channelId")]
    pub channel_id: String,
    pub badge: u32,
    #[serde(rename = "categoryId")]
    pub category_id: String,
}

/// Payload tag consumed by the client for tap-to-acknowledge and for
/// de-duplicating against a live-delivered toast.
#[derive(Debug, Clone, Serialize)]
pub struct YoData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "fromUser")]
    pub from_user: String,
    pub timestamp: String,
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorDetails {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushTicket {
    Ok {
        id: String,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<ProviderErrorDetails>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushReceipt {
    Ok {},
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<ProviderErrorDetails>,
    },
}

/// Error classes the provider distinguishes. Only `UnregisteredDevice`
/// invalidates the stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushErrorKind {
    InvalidToken,
    PayloadTooLarge,
    RateExceeded,
    CredentialInvalid,
    UnregisteredDevice,
    Provider,
}

impl PushErrorKind {
    fn from_provider_code(code: &str) -> Self {
        match code {
            "DeviceNotRegistered" => PushErrorKind::UnregisteredDevice,
            "MessageTooBig" => PushErrorKind::PayloadTooLarge,
            "MessageRateExceeded" => PushErrorKind::RateExceeded,
            "InvalidCredentials" => PushErrorKind::CredentialInvalid,
            _ => PushErrorKind::Provider,
        }
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push provider returned malformed response: {0}")]
    Malformed(String),
}

/// Result of one push hand-off. `delivered` means the provider accepted the
/// message, not that the device received it; actual delivery is confirmed
/// later by the receipt check.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub delivered: bool,
    pub error: Option<PushErrorKind>,
    pub should_remove_token: bool,
    pub ticket_id: Option<String>,
}

impl PushOutcome {
    fn failure(error: PushErrorKind) -> Self {
        Self {
            delivered: false,
            should_remove_token: error == PushErrorKind::UnregisteredDevice,
            error: Some(error),
            ticket_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub accepted: usize,
    pub failed: usize,
    pub total: usize,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError>;
    async fn check_receipts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PushReceipt>, PushError>;
}

/// Hook invoked when the provider reports a token as permanently dead.
/// Failures are logged by the dispatcher, never propagated.
#[async_trait]
pub trait TokenCleanup: Send + Sync {
    async fn clear_token(&self, username: &Username) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PushDispatcher {
    transport: Arc<dyn PushTransport>,
    cleanup: Arc<dyn TokenCleanup>,
    receipt_delay: Duration,
}

impl PushDispatcher {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        cleanup: Arc<dyn TokenCleanup>,
        receipt_delay: Duration,
    ) -> Self {
        Self {
            transport,
            cleanup,
            receipt_delay,
        }
    }

    pub fn yo_message(token: &str, from: &Username) -> PushMessage {
        PushMessage {
            to: token.to_string(),
            sound: "yo-sound.wav".to_string(),
            title: "Yo! 👋".to_string(),
            body: format!("{from} sent you a Yo!"),
            data: YoData {
                kind: "yo".to_string(),
                from_user: from.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                action: "yo_received".to_string(),
            },
            priority: "high".to_string(),
            ttl: 3600,
            channel_id: "yo-notifications".to_string(),
            badge: 1,
            category_id: "yo-category".to_string(),
        }
    }

    /// Hands one Yo to the provider for `recipient`'s token. A malformed
    /// token short-circuits without a network call. On a successful hand-off
    /// a deferred receipt check is scheduled; the caller never waits on it.
    pub async fn send_yo(&self, recipient: &Username, token: &str, from: &Username) -> PushOutcome {
        if !is_valid_token_format(token) {
            debug!(%recipient, "malformed delivery token, skipping provider call");
            return PushOutcome::failure(PushErrorKind::InvalidToken);
        }

        let message = Self::yo_message(token, from);
        let tickets = match self.transport.send(&[message]).await {
            Ok(tickets) => tickets,
            Err(error) => {
                warn!(%recipient, %error, "push hand-off failed");
                return PushOutcome::failure(PushErrorKind::Provider);
            }
        };

        match tickets.into_iter().next() {
            Some(PushTicket::Ok { id }) => {
                self.schedule_receipt_check(id.clone(), recipient.clone());
                PushOutcome {
                    delivered: true,
                    error: None,
                    should_remove_token: false,
                    ticket_id: Some(id),
                }
            }
            Some(PushTicket::Error { message, details }) => {
                let kind = details
                    .and_then(|d| d.error)
                    .map(|code| PushErrorKind::from_provider_code(&code))
                    .unwrap_or(PushErrorKind::Provider);
                debug!(%recipient, ?message, ?kind, "push ticket rejected");
                PushOutcome::failure(kind)
            }
            None => {
                warn!(%recipient, "push provider returned no tickets");
                PushOutcome::failure(PushErrorKind::Provider)
            }
        }
    }

    /// Best-effort fan-out to many tokens. Malformed tokens are dropped up
    /// front; a failed chunk does not abort the remaining chunks.
    pub async fn send_to_many(
        &self,
        recipients: &[(Username, String)],
        from: &Username,
    ) -> BatchOutcome {
        let valid: Vec<&(Username, String)> = recipients
            .iter()
            .filter(|(_, token)| is_valid_token_format(token))
            .collect();

        let mut outcome = BatchOutcome {
            total: valid.len(),
            ..BatchOutcome::default()
        };

        for chunk in valid.chunks(MAX_BATCH_SIZE) {
            let messages: Vec<PushMessage> = chunk
                .iter()
                .map(|(_, token)| Self::yo_message(token, from))
                .collect();

            let tickets = match self.transport.send(&messages).await {
                Ok(tickets) => tickets,
                Err(error) => {
                    warn!(%error, chunk_len = chunk.len(), "push chunk failed");
                    outcome.failed += chunk.len();
                    continue;
                }
            };

            for ((recipient, _), ticket) in chunk.iter().zip(tickets) {
                match ticket {
                    PushTicket::Ok { id } => {
                        outcome.accepted += 1;
                        self.schedule_receipt_check(id, recipient.clone());
                    }
                    PushTicket::Error { message, details } => {
                        outcome.failed += 1;
                        let kind = details
                            .and_then(|d| d.error)
                            .map(|code| PushErrorKind::from_provider_code(&code))
                            .unwrap_or(PushErrorKind::Provider);
                        debug!(%recipient, ?message, ?kind, "push ticket rejected in batch");
                        if kind == PushErrorKind::UnregisteredDevice {
                            self.clear_token_best_effort(recipient).await;
                        }
                    }
                }
            }
        }

        outcome
    }

    /// Confirms actual delivery for a hand-off the provider accepted. A
    /// permanent non-delivery (unregistered device) clears the recipient's
    /// stored token; everything else is only logged.
    pub async fn check_receipt(&self, ticket_id: &str, recipient: &Username) {
        let receipts = match self.transport.check_receipts(&[ticket_id.to_string()]).await {
            Ok(receipts) => receipts,
            Err(error) => {
                warn!(%ticket_id, %error, "receipt lookup failed");
                return;
            }
        };

        match receipts.get(ticket_id) {
            None => debug!(%ticket_id, "receipt not yet available"),
            Some(PushReceipt::Ok {}) => debug!(%ticket_id, "push delivery confirmed"),
            Some(PushReceipt::Error { message, details }) => {
                let code = details.as_ref().and_then(|d| d.error.as_deref());
                warn!(%ticket_id, ?message, ?code, "push delivery failed");
                if code == Some("DeviceNotRegistered") {
                    self.clear_token_best_effort(recipient).await;
                }
            }
        }
    }

    fn schedule_receipt_check(&self, ticket_id: String, recipient: Username) {
        let dispatcher = self.clone();
        let delay = self.receipt_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.check_receipt(&ticket_id, &recipient).await;
        });
    }

    async fn clear_token_best_effort(&self, recipient: &Username) {
        if let Err(error) = self.cleanup.clear_token(recipient).await {
            warn!(%recipient, %error, "failed to clear dead delivery token");
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
