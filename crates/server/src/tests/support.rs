use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use push::{
    PushDispatcher, PushError, PushMessage, PushReceipt, PushTicket, PushTransport,
};
use server_api::{ApiContext, StorageTokenCleanup};
use storage::Storage;

use crate::app_state::AppState;

/// Transport that accepts every message without touching the network.
pub struct RecordingTransport {
    pub sends: AtomicUsize,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn send(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, PushError> {
        let batch = self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(messages
            .iter()
            .enumerate()
            .map(|(i, _)| PushTicket::Ok {
                id: format!("ticket-{batch}-{i}"),
            })
            .collect())
    }

    async fn check_receipts(
        &self,
        _ids: &[String],
    ) -> Result<std::collections::HashMap<String, PushReceipt>, PushError> {
        Ok(std::collections::HashMap::new())
    }
}

pub async fn test_state() -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let transport = Arc::new(RecordingTransport {
        sends: AtomicUsize::new(0),
    });
    let cleanup = Arc::new(StorageTokenCleanup(storage.clone()));
    let push = PushDispatcher::new(transport, cleanup, Duration::ZERO);
    Arc::new(AppState {
        ctx: ApiContext::new(storage, push),
    })
}
