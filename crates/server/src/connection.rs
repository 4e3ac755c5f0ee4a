//! Connection lifecycle: `Connecting -> Joined -> Disconnected`.
//!
//! A socket starts anonymous. The first join announcement carries the
//! identity (and optionally a delivery token) and registers the connection
//! in the presence registry; the transport-level close unwinds it again.
//! Unregistration is guarded by connection id, so a disconnect event from a
//! superseded socket leaves a fresher session untouched.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use server_api::LiveHandle;
use shared::{
    domain::{ConnectionId, Username},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, JoinRequest, ServerEvent},
};

use crate::app_state::AppState;

pub(crate) struct Connection {
    state: Arc<AppState>,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
    /// `None` while still in the connecting state.
    joined: Option<Username>,
}

impl Connection {
    pub(crate) fn new(state: Arc<AppState>, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            state,
            connection_id: ConnectionId::new(),
            tx,
            joined: None,
        }
    }

    pub(crate) fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub(crate) async fn handle_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Join(payload) => self.handle_join(payload.into_join()).await,
            ClientRequest::SendYo { to } => self.handle_send(to).await,
        }
    }

    async fn handle_join(&mut self, join: JoinRequest) {
        let ctx = &self.state.ctx;
        let username = join.username.clone();

        if let Err(error) = ctx.storage.create_user(&username).await {
            warn!(%username, %error, "join failed: could not upsert user");
            self.reply_error(ErrorCode::Internal, "join failed");
            return;
        }
        if let Err(error) = ctx.storage.set_online(&username, true, Utc::now()).await {
            warn!(%username, %error, "failed to persist online flag");
        }
        if let Some(token) = &join.push_token {
            if let Err(error) = ctx.storage.set_delivery_token(&username, Some(token)).await {
                warn!(%username, %error, "failed to persist delivery token");
            }
        }

        // A re-join under a different name releases the old registration,
        // guarded so only this connection's own entry can be removed.
        if let Some(previous) = self.joined.take() {
            if previous != username {
                ctx.presence.unregister(&previous, self.connection_id);
            }
        }

        let handle = LiveHandle::new(self.connection_id, self.tx.clone());
        ctx.presence.register(username.clone(), handle);
        self.joined = Some(username.clone());

        ctx.presence.broadcast_except(
            self.connection_id,
            &ServerEvent::UserOnline {
                username: username.clone(),
            },
        );

        info!(
            %username,
            connection = %self.connection_id,
            token_updated = join.push_token.is_some(),
            "joined and is online"
        );
    }

    async fn handle_send(&mut self, to: Username) {
        let Some(sender) = self.joined.clone() else {
            self.reply_error(ErrorCode::Unauthorized, "join before sending");
            return;
        };

        match server_api::send_yo(&self.state.ctx, &sender, &to).await {
            Ok(confirmation) => {
                let _ = self.tx.send(confirmation);
            }
            Err(error) => {
                let _ = self.tx.send(ServerEvent::Error(error));
            }
        }
    }

    pub(crate) async fn handle_disconnect(&mut self) {
        // Disconnect before join completes is a no-op.
        let Some(username) = self.joined.take() else {
            return;
        };

        let ctx = &self.state.ctx;
        if !ctx.presence.unregister(&username, self.connection_id) {
            // A newer session owns the registration now; this close event is
            // stale and must not mark the identity offline.
            debug!(%username, connection = %self.connection_id, "stale disconnect ignored");
            return;
        }

        if let Err(error) = ctx.storage.set_online(&username, false, Utc::now()).await {
            warn!(%username, %error, "failed to persist offline flag");
        }

        ctx.presence.broadcast_except(
            self.connection_id,
            &ServerEvent::UserOffline {
                username: username.clone(),
            },
        );

        info!(%username, connection = %self.connection_id, "disconnected and is offline");
    }

    fn reply_error(&self, code: ErrorCode, message: &str) {
        let _ = self
            .tx
            .send(ServerEvent::Error(ApiError::new(code, message)));
    }
}

pub(crate) async fn serve(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state, tx);

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => connection.handle_request(request).await,
            Err(error) => {
                debug!(%error, "malformed client request");
                connection.reply_error(ErrorCode::Validation, "malformed request");
            }
        }
    }

    connection.handle_disconnect().await;
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
