//! End-to-end text messaging over established sessions.

mod common;

use common::{init_tracing, make_friends, register_and_connect, wait_until};
use obscura_core::messages::{Direction, MessageBody};
use obscura_core::testing::TestServer;

#[tokio::test]
async fn text_message_is_delivered_and_persisted() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    let report = alice.send_text("bob", "Hello from Alice!").await.unwrap();
    assert_eq!(report.successes, 1);
    assert_eq!(report.failures, 0);

    let bob_handle = bob.clone();
    wait_until("bob to persist the message", move || {
        bob_handle
            .messages()
            .conversation("alice")
            .is_ok_and(|msgs| !msgs.is_empty())
    })
    .await;

    let inbox = bob.messages().conversation("alice").unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].direction, Direction::Inbound);
    assert_eq!(inbox[0].body, MessageBody::Text("Hello from Alice!".into()));

    // Acknowledged only after routing and persistence succeeded, so the
    // server queue drains.
    let server_handle = server.clone();
    wait_until("bob's queue to drain", move || {
        server_handle.pending_count(&common::server_user_id("bob", 1)) == 0
    })
    .await;
}

#[tokio::test]
async fn conversation_flows_both_ways() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    alice.send_text("bob", "ping").await.unwrap();
    let bob_handle = bob.clone();
    wait_until("ping to arrive", move || {
        bob_handle
            .messages()
            .conversation("alice")
            .is_ok_and(|m| m.len() == 1)
    })
    .await;

    bob.send_text("alice", "pong").await.unwrap();
    let alice_handle = alice.clone();
    wait_until("pong to arrive", move || {
        alice_handle
            .messages()
            .conversation("bob")
            .is_ok_and(|m| m.len() == 2)
    })
    .await;

    let alice_view = alice.messages().conversation("bob").unwrap();
    assert_eq!(alice_view[0].direction, Direction::Outbound);
    assert_eq!(alice_view[1].direction, Direction::Inbound);
    assert_eq!(alice_view[1].body, MessageBody::Text("pong".into()));
}

#[tokio::test]
async fn a_burst_of_messages_arrives_in_order() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    for i in 0..10 {
        alice.send_text("bob", &format!("message {i}")).await.unwrap();
        // Distinct millisecond timestamps keep the history ordering exact.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let bob_handle = bob.clone();
    wait_until("all ten to arrive", move || {
        bob_handle
            .messages()
            .conversation("alice")
            .is_ok_and(|m| m.len() == 10)
    })
    .await;

    let inbox = bob.messages().conversation("alice").unwrap();
    let texts: Vec<String> = inbox
        .iter()
        .filter_map(|m| match &m.body {
            MessageBody::Text(t) => Some(t.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("message {i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn prekeys_replenish_after_decrypts() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    alice.send_text("bob", "hello").await.unwrap();

    // Bob's first decrypt consumed a one-time prekey server-side (the
    // bundle handout) and triggers replenishment back above the floor.
    let server_handle = server.clone();
    wait_until("bob's prekey pool to stay stocked", move || {
        server_handle.prekey_count(&common::server_user_id("bob", 1)) >= 49
    })
    .await;
}
