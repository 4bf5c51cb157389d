//! Linking a second device: approval, state import, and self-sync.

mod common;

use common::{init_tracing, make_friends, register_and_connect, spawn_device, wait_until};
use obscura_core::error::CoreError;
use obscura_core::friends::FriendStatus;
use obscura_core::messages::{Direction, MessageBody};
use obscura_core::testing::TestServer;
use obscura_protocol::ProtocolError;

#[tokio::test]
async fn linked_device_imports_friends_and_receives_sent_sync() {
    init_tracing();
    let server = TestServer::new();
    let (alice1, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice1, "alice", &bob, "bob").await;

    // Second device joins with a link code.
    let alice2 = spawn_device(&server, "alice", 2);
    let code = alice2.register_linked(None).await.unwrap();
    alice2.connect();
    alice1.approve_link(&code).await.unwrap();

    // Friend lists converge: same usernames and statuses.
    let alice2_handle = alice2.clone();
    wait_until("alice2 to import the friend list", move || {
        alice2_handle
            .friends()
            .get("bob")
            .ok()
            .flatten()
            .is_some_and(|f| f.status == FriendStatus::Accepted)
    })
    .await;
    let first = alice1.friends().all().unwrap();
    let second = alice2.friends().all().unwrap();
    assert_eq!(first.len(), second.len());
    for friend in &first {
        let imported = alice2.friends().get(&friend.username).unwrap().unwrap();
        assert_eq!(imported.status, friend.status);
    }

    // Both sides of the account know each other.
    assert_eq!(alice1.device_graph().own_devices().unwrap().len(), 1);
    let alice2_handle = alice2.clone();
    wait_until("alice2 to learn its sibling", move || {
        alice2_handle
            .device_graph()
            .own_devices()
            .is_ok_and(|d| d.len() == 1)
    })
    .await;

    // A send from the first device reaches the second as SENT_SYNC.
    alice1.send_text("bob", "hi from device one").await.unwrap();

    let alice2_handle = alice2.clone();
    wait_until("sent-sync to arrive on alice2", move || {
        alice2_handle
            .messages()
            .conversation("bob")
            .is_ok_and(|m| !m.is_empty())
    })
    .await;
    let synced = alice2.messages().conversation("bob").unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].direction, Direction::Outbound);
    assert_eq!(synced[0].conversation_id, "bob");
    assert_eq!(synced[0].body, MessageBody::Text("hi from device one".into()));

    // And bob sees alice as a two-device account.
    let bob_handle = bob.clone();
    wait_until("bob to learn alice's second device", move || {
        bob_handle
            .friends()
            .get("alice")
            .ok()
            .flatten()
            .is_some_and(|f| f.devices.len() == 2)
    })
    .await;
}

#[tokio::test]
async fn link_code_cannot_be_approved_twice() {
    init_tracing();
    let server = TestServer::new();
    let (alice1, _) = register_and_connect(&server, "alice").await;

    let alice2 = spawn_device(&server, "alice", 2);
    let code = alice2.register_linked(None).await.unwrap();
    alice2.connect();

    alice1.approve_link(&code).await.unwrap();
    let err = alice1.approve_link(&code).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Protocol(ProtocolError::LinkReplayed)
    ));
}
