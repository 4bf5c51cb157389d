//! Device revocation with the recovery phrase.

mod common;

use common::{init_tracing, make_friends, register_and_connect, spawn_device, wait_until};
use obscura_core::testing::TestServer;

#[tokio::test]
async fn revoking_a_device_shrinks_every_view_and_wipes_it() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob1, bob_phrase) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob1, "bob").await;

    // Link a second bob device.
    let bob2 = spawn_device(&server, "bob", 2);
    let code = bob2.register_linked(None).await.unwrap();
    bob2.connect();
    bob1.approve_link(&code).await.unwrap();

    // Everyone settles: alice sees two bob devices, and bob2 has pinned
    // the account recovery key via the approval.
    let alice_handle = alice.clone();
    wait_until("alice to see both bob devices", move || {
        alice_handle
            .friends()
            .get("bob")
            .ok()
            .flatten()
            .is_some_and(|f| f.devices.len() == 2)
    })
    .await;
    let alice_friend_bob = alice.friends().get("bob").unwrap().unwrap();
    assert!(alice_friend_bob.recovery_public_key.is_some());

    let bob2_handle = bob2.clone();
    wait_until("bob2 to finish the link import", move || {
        bob2_handle
            .device_identity()
            .ok()
            .flatten()
            .is_some_and(|d| !d.recovery_public_key.is_empty())
    })
    .await;

    // Bob revokes the second device from the first, once bob1 has the
    // announce that carries bob2's full uuid.
    let bob2_uuid = bob2.device_identity().unwrap().unwrap().device_uuid;
    let bob1_handle = bob1.clone();
    let uuid = bob2_uuid.clone();
    wait_until("bob1 to learn bob2's full identity", move || {
        bob1_handle
            .device_graph()
            .own_devices()
            .is_ok_and(|devices| devices.iter().any(|d| d.device_uuid == uuid))
    })
    .await;
    bob1.revoke_device(&bob_phrase, &bob2_uuid).await.unwrap();

    // Alice's view of bob shrinks to one device.
    let alice_handle = alice.clone();
    wait_until("alice to drop the revoked device", move || {
        alice_handle
            .friends()
            .get("bob")
            .ok()
            .flatten()
            .is_some_and(|f| f.devices.len() == 1)
    })
    .await;

    // Bob1 no longer lists a sibling device.
    assert!(bob1.device_graph().own_devices().unwrap().is_empty());

    // Bob2 wipes its local state on receipt.
    let bob2_handle = bob2.clone();
    wait_until("bob2 to wipe itself", move || {
        bob2_handle
            .keystore()
            .has_identity()
            .is_ok_and(|has| !has)
    })
    .await;
    assert!(bob2.friends().all().unwrap().is_empty());
}

#[tokio::test]
async fn wrong_phrase_cannot_revoke() {
    init_tracing();
    let server = TestServer::new();
    let (bob1, _) = register_and_connect(&server, "bob").await;

    let bob2 = spawn_device(&server, "bob", 2);
    let code = bob2.register_linked(None).await.unwrap();
    bob2.connect();
    bob1.approve_link(&code).await.unwrap();

    let bob2_uuid = bob2.device_identity().unwrap().unwrap().device_uuid;
    let (_, other_phrase) = obscura_crypto::recovery::RecoveryKeyPair::generate();
    let err = bob1
        .revoke_device(&other_phrase, &bob2_uuid)
        .await
        .unwrap_err();
    assert!(matches!(err, obscura_core::CoreError::Auth(_)));

    // Nothing was broadcast; bob1 still lists its sibling.
    assert_eq!(bob1.device_graph().own_devices().unwrap().len(), 1);
}
