//! Shared harness: real cores over the in-memory server, no mocking.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use obscura_core::compress::GzipCompress;
use obscura_core::storage::MemoryStorage;
use obscura_core::testing::TestServer;
use obscura_core::{Core, CoreConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

pub fn server_user_id(username: &str, device_index: u32) -> String {
    format!("srv-{username}-{device_index}")
}

/// Build a core for one device of `username` against the shared server.
pub fn spawn_device(server: &TestServer, username: &str, device_index: u32) -> Arc<Core> {
    let id = server_user_id(username, device_index);
    let mut config = CoreConfig::new(username, &id);
    config.chunks_per_second = 50;
    config.ttl_sweep_interval = Duration::from_millis(100);
    Core::open(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(GzipCompress::new()),
        server.api_for(&id),
        server.gateway_for(&id),
    )
}

/// Register a first device and bring its gateway up.
pub async fn register_and_connect(
    server: &TestServer,
    username: &str,
) -> (Arc<Core>, String) {
    let core = spawn_device(server, username, 1);
    let output = core.register(None).await.expect("register");
    core.connect();
    (core, output.recovery_phrase)
}

/// Poll until `cond` holds, panicking after five seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Run the request/accept dance until both sides are accepted friends.
pub async fn make_friends(alice: &Arc<Core>, alice_name: &str, bob: &Arc<Core>, bob_name: &str) {
    alice
        .send_friend_request(bob_name, &server_user_id(bob_name, 1))
        .await
        .expect("friend request");

    let bob_handle = bob.clone();
    let alice_name_owned = alice_name.to_string();
    wait_until("friend request to arrive", move || {
        bob_handle
            .friends()
            .get(&alice_name_owned)
            .ok()
            .flatten()
            .is_some()
    })
    .await;

    bob.respond_friend_request(alice_name, true)
        .await
        .expect("friend response");

    let alice_handle = alice.clone();
    let bob_name_owned = bob_name.to_string();
    wait_until("friend response to arrive", move || {
        alice_handle
            .friends()
            .get(&bob_name_owned)
            .ok()
            .flatten()
            .is_some_and(|f| f.status == obscura_core::friends::FriendStatus::Accepted)
    })
    .await;
}
