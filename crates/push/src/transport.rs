use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{PushError, PushMessage, PushReceipt, PushTicket, PushTransport};

/// Expo-compatible HTTP push transport. `base_url` points at the provider's
/// push API root, e.g. `https://exp.host/--/api/v2/push`.
#[derive(Clone)]
pub struct HttpPushTransport {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    data: Vec<PushTicket>,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    data: HashMap<String, PushReceipt>,
}

impl HttpPushTransport {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}/{path}", self.base_url));
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError> {
        let response = self
            .request("send")
            .json(messages)
            .send()
            .await?
            .error_for_status()?;
        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| PushError::Malformed(e.to_string()))?;
        Ok(body.data)
    }

    async fn check_receipts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PushReceipt>, PushError> {
        let response = self
            .request("getReceipts")
            .json(&serde_json::json!({ "ids": ids }))
            .send()
            .await?
            .error_for_status()?;
        let body: ReceiptResponse = response
            .json()
            .await
            .map_err(|e| PushError::Malformed(e.to_string()))?;
        Ok(body.data)
    }
}
