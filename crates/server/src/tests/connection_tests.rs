use super::*;

use tokio::sync::mpsc::UnboundedReceiver;

#[path = "support.rs"]
mod support;

use support::test_state;

const TOKEN: &str = "ExponentPushToken[conn-test]";

async fn join(
    state: &Arc<AppState>,
    name: &str,
    token: Option<&str>,
) -> (Connection, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(state.clone(), tx);
    connection
        .handle_request(ClientRequest::Join(
            shared::protocol::JoinPayload::Full {
                username: Username::from(name),
                push_token: token.map(str::to_string),
            },
        ))
        .await;
    (connection, rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn join_registers_presence_and_persists_state() {
    let state = test_state().await;
    let (_conn, _rx) = join(&state, "alice", Some(TOKEN)).await;

    assert!(state.ctx.presence.is_online(&Username::from("alice")));
    let stored = state
        .ctx
        .storage
        .find_user(&Username::from("alice"))
        .await
        .expect("query")
        .expect("user");
    assert!(stored.is_online);
    assert_eq!(stored.delivery_token.as_deref(), Some(TOKEN));
}

#[tokio::test]
async fn legacy_string_join_is_accepted() {
    let state = test_state().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(state.clone(), tx);
    connection
        .handle_request(ClientRequest::Join(
            shared::protocol::JoinPayload::Legacy("bob".to_string()),
        ))
        .await;

    assert!(state.ctx.presence.is_online(&Username::from("bob")));
    let stored = state
        .ctx
        .storage
        .find_user(&Username::from("bob"))
        .await
        .expect("query")
        .expect("user");
    assert!(stored.delivery_token.is_none());
}

#[tokio::test]
async fn join_is_announced_to_other_connections_only() {
    let state = test_state().await;
    let (_alice, mut alice_rx) = join(&state, "alice", None).await;
    let (_bob, mut bob_rx) = join(&state, "bob", None).await;

    let seen_by_alice = drain(&mut alice_rx);
    assert!(matches!(
        seen_by_alice.as_slice(),
        [ServerEvent::UserOnline { username }] if username.as_str() == "bob"
    ));
    // The joiner does not receive their own announcement.
    assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn disconnect_marks_offline_and_broadcasts() {
    let state = test_state().await;
    let (_alice, mut alice_rx) = join(&state, "alice", None).await;
    let (mut bob, _bob_rx) = join(&state, "bob", None).await;
    drain(&mut alice_rx);

    bob.handle_disconnect().await;

    assert!(!state.ctx.presence.is_online(&Username::from("bob")));
    let stored = state
        .ctx
        .storage
        .find_user(&Username::from("bob"))
        .await
        .expect("query")
        .expect("user");
    assert!(!stored.is_online);

    let seen_by_alice = drain(&mut alice_rx);
    assert!(matches!(
        seen_by_alice.as_slice(),
        [ServerEvent::UserOffline { username }] if username.as_str() == "bob"
    ));
}

#[tokio::test]
async fn stale_disconnect_does_not_evict_newer_session() {
    let state = test_state().await;
    let (mut old_session, _old_rx) = join(&state, "alice", None).await;
    let (_new_session, _new_rx) = join(&state, "alice", None).await;

    // The close event from the superseded socket arrives late.
    old_session.handle_disconnect().await;

    assert!(state.ctx.presence.is_online(&Username::from("alice")));
    let stored = state
        .ctx
        .storage
        .find_user(&Username::from("alice"))
        .await
        .expect("query")
        .expect("user");
    assert!(stored.is_online);
}

#[tokio::test]
async fn send_before_join_is_rejected() {
    let state = test_state().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(state, tx);

    connection
        .handle_request(ClientRequest::SendYo {
            to: Username::from("bob"),
        })
        .await;

    let events = drain(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::Error(error)] if error.code == ErrorCode::Unauthorized
    ));
}

#[tokio::test]
async fn send_confirms_to_sender_and_reaches_recipient() {
    let state = test_state().await;
    state
        .ctx
        .storage
        .create_user(&Username::from("alice"))
        .await
        .expect("user");
    state
        .ctx
        .storage
        .create_user(&Username::from("bob"))
        .await
        .expect("user");
    state
        .ctx
        .storage
        .add_friend(&Username::from("alice"), &Username::from("bob"))
        .await
        .expect("friend");

    let (mut alice, mut alice_rx) = join(&state, "alice", None).await;
    let (_bob, mut bob_rx) = join(&state, "bob", None).await;
    drain(&mut alice_rx);

    alice
        .handle_request(ClientRequest::SendYo {
            to: Username::from("bob"),
        })
        .await;

    let confirmations = drain(&mut alice_rx);
    assert!(matches!(
        confirmations.as_slice(),
        [ServerEvent::YoSent { to, success: true, reason: None }] if to.as_str() == "bob"
    ));

    let received = drain(&mut bob_rx);
    assert!(matches!(
        received.as_slice(),
        [ServerEvent::YoReceived { from, total_yos: 1, .. }] if from.as_str() == "alice"
    ));
}
