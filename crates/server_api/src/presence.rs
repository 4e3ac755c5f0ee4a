//! In-memory presence registry: identity -> current live connection handle.
//!
//! At most one handle per identity; a new registration displaces the prior
//! one (last-registration-wins). Removal is compare-and-delete keyed by
//! connection id so a delayed disconnect from a superseded socket cannot
//! evict a fresher session. Nothing here persists; a process restart makes
//! everyone offline.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use shared::{
    domain::{ConnectionId, Username},
    protocol::ServerEvent,
};

/// Send side of one live connection. Emitting is fire-and-forget into the
/// connection's outbound queue; a `false` return means the socket task is
/// already gone.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl LiveHandle {
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn emit(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Debug)]
struct Registration {
    handle: LiveHandle,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PresenceRegistry {
    inner: DashMap<Username, Registration>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle` as the current connection for `identity`,
    /// unconditionally replacing any prior one. Returns the displaced handle;
    /// the reference design does not notify it.
    pub fn register(&self, identity: Username, handle: LiveHandle) -> Option<LiveHandle> {
        self.inner
            .insert(
                identity,
                Registration {
                    handle,
                    connected_at: Utc::now(),
                },
            )
            .map(|prior| prior.handle)
    }

    /// Compare-and-delete: removes the mapping only if the registered handle
    /// still belongs to `connection_id`. A stale disconnect is a no-op.
    pub fn unregister(&self, identity: &Username, connection_id: ConnectionId) -> bool {
        self.inner
            .remove_if(identity, |_, registration| {
                registration.handle.connection_id == connection_id
            })
            .is_some()
    }

    pub fn lookup(&self, identity: &Username) -> Option<LiveHandle> {
        self.inner.get(identity).map(|r| r.handle.clone())
    }

    pub fn is_online(&self, identity: &Username) -> bool {
        self.inner.contains_key(identity)
    }

    pub fn connected_since(&self, identity: &Username) -> Option<DateTime<Utc>> {
        self.inner.get(identity).map(|r| r.connected_at)
    }

    pub fn online_count(&self) -> usize {
        self.inner.len()
    }

    /// Fan-out to every registered handle except the named connection.
    /// Fire-and-forget; dead handles are skipped, not reaped.
    pub fn broadcast_except(&self, exclude: ConnectionId, event: &ServerEvent) {
        for entry in self.inner.iter() {
            let handle = &entry.value().handle;
            if handle.connection_id != exclude {
                handle.emit(event.clone());
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
