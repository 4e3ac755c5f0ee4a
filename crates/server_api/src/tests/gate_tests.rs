use super::*;

async fn setup() -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for name in ["alice", "bob", "carol", "dave"] {
        storage.create_user(&Username::from(name)).await.expect("user");
    }
    storage
}

fn user(name: &str) -> Username {
    Username::from(name)
}

#[tokio::test]
async fn unknown_recipient_is_denied_first() {
    let storage = setup().await;
    let decision = admit(&storage, &user("alice"), &user("ghost"))
        .await
        .expect("admit");
    assert_eq!(
        decision,
        AdmitDecision::Deny(DenyReason::UnknownRecipient)
    );
}

#[tokio::test]
async fn non_friends_are_denied_regardless_of_block_state() {
    let storage = setup().await;
    // bob has blocked alice, but they are also not friends; the friend check
    // comes first and wins.
    storage
        .block_user(&user("bob"), &user("alice"))
        .await
        .expect("block");

    let decision = admit(&storage, &user("alice"), &user("bob"))
        .await
        .expect("admit");
    assert_eq!(decision, AdmitDecision::Deny(DenyReason::NotFriends));
}

#[tokio::test]
async fn block_overrides_a_lingering_friend_entry() {
    let storage = setup().await;
    // Inconsistent data: carol blocked dave, yet a friend entry reappeared.
    storage
        .block_user(&user("carol"), &user("dave"))
        .await
        .expect("block");
    storage
        .add_friend(&user("carol"), &user("dave"))
        .await
        .expect("friend");

    let decision = admit(&storage, &user("dave"), &user("carol"))
        .await
        .expect("admit");
    assert_eq!(
        decision,
        AdmitDecision::Deny(DenyReason::BlockedByRecipient)
    );
}

#[tokio::test]
async fn friend_check_is_against_the_senders_own_list() {
    let storage = setup().await;
    // One-directional friendship row: only bob lists alice.
    sqlx::query("INSERT INTO friendships (owner, friend) VALUES ('bob', 'alice')")
        .execute(storage.pool())
        .await
        .expect("insert");

    let from_alice = admit(&storage, &user("alice"), &user("bob"))
        .await
        .expect("admit");
    assert_eq!(from_alice, AdmitDecision::Deny(DenyReason::NotFriends));

    let from_bob = admit(&storage, &user("bob"), &user("alice"))
        .await
        .expect("admit");
    assert_eq!(from_bob, AdmitDecision::Allow);
}

#[tokio::test]
async fn mutual_friends_are_admitted() {
    let storage = setup().await;
    storage
        .add_friend(&user("alice"), &user("bob"))
        .await
        .expect("friend");

    let decision = admit(&storage, &user("alice"), &user("bob"))
        .await
        .expect("admit");
    assert!(decision.is_allow());
}
