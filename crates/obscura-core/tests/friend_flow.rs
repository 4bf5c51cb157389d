//! Friend exchange between two freshly registered accounts.

mod common;

use common::{init_tracing, make_friends, register_and_connect, server_user_id, wait_until};
use obscura_core::friends::FriendStatus;
use obscura_core::testing::TestServer;

#[tokio::test]
async fn request_and_accept_yields_one_device_each() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;

    make_friends(&alice, "alice", &bob, "bob").await;

    let bob_on_alice = alice.friends().get("bob").unwrap().unwrap();
    assert_eq!(bob_on_alice.status, FriendStatus::Accepted);
    assert_eq!(bob_on_alice.devices.len(), 1);

    let alice_on_bob = bob.friends().get("alice").unwrap().unwrap();
    assert_eq!(alice_on_bob.status, FriendStatus::Accepted);
    assert_eq!(alice_on_bob.devices.len(), 1);
}

#[tokio::test]
async fn verify_codes_are_four_digit_strings() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;

    make_friends(&alice, "alice", &bob, "bob").await;

    // Both sides have TOFU-pinned the peer identity by now.
    let alice_code = alice
        .verify_code_for(&server_user_id("bob", 1))
        .unwrap()
        .expect("alice has pinned bob");
    let bob_handle = bob.clone();
    wait_until("bob to pin alice", move || {
        bob_handle
            .verify_code_for(&server_user_id("alice", 1))
            .ok()
            .flatten()
            .is_some()
    })
    .await;
    let bob_code = bob
        .verify_code_for(&server_user_id("alice", 1))
        .unwrap()
        .expect("bob has pinned alice");

    for code in [&alice_code, &bob_code] {
        assert_eq!(code.len(), 4);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}

#[tokio::test]
async fn rejection_removes_the_pending_friend() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;

    alice
        .send_friend_request("bob", &server_user_id("bob", 1))
        .await
        .unwrap();
    let bob_handle = bob.clone();
    wait_until("request to arrive", move || {
        bob_handle.friends().get("alice").ok().flatten().is_some()
    })
    .await;

    bob.respond_friend_request("alice", false).await.unwrap();

    let alice_handle = alice.clone();
    wait_until("rejection to arrive", move || {
        alice_handle.friends().get("bob").ok().flatten().is_none()
    })
    .await;
    assert!(bob.friends().get("alice").unwrap().is_none());
}
