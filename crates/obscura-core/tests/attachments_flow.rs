//! Attachment upload, fan-out, and chunked download.

mod common;

use common::{init_tracing, make_friends, register_and_connect, wait_until};
use obscura_core::messages::MessageBody;
use obscura_core::testing::TestServer;
use obscura_protocol::transport::MAX_BLOB_BYTES;
use obscura_protocol::types::AttachmentPointer;

/// A deterministic fake JPEG: SOI marker then a repeating pattern.
fn fake_jpeg(len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF];
    data.extend((3..len).map(|i| (i % 251) as u8));
    data
}

#[tokio::test]
async fn small_attachment_roundtrip() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    let image = fake_jpeg(64 * 1024);
    let (report, pointer) = alice
        .send_attachment("bob", &image, "image/jpeg", Some("small.jpg".into()))
        .await
        .unwrap();
    assert_eq!(report.successes, 1);
    assert!(matches!(pointer, AttachmentPointer::Single(_)));

    let bob_handle = bob.clone();
    wait_until("content reference to arrive", move || {
        bob_handle
            .messages()
            .conversation("alice")
            .is_ok_and(|m| !m.is_empty())
    })
    .await;

    let inbox = bob.messages().conversation("alice").unwrap();
    let MessageBody::Attachment(received) = &inbox[0].body else {
        panic!("expected an attachment message");
    };
    let downloaded = bob.download_attachment(received).await.unwrap();
    assert_eq!(downloaded, image);
}

#[tokio::test]
async fn two_mib_jpeg_chunks_and_reassembles() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    let image = fake_jpeg(2 * 1024 * 1024);
    let (_, pointer) = alice
        .send_attachment("bob", &image, "image/jpeg", Some("photo.jpg".into()))
        .await
        .unwrap();

    let AttachmentPointer::Chunked(ref chunked) = pointer else {
        panic!("2 MiB upload must be chunked");
    };
    let expected_chunks = image.len().div_ceil(MAX_BLOB_BYTES);
    assert_eq!(chunked.chunks.len(), expected_chunks);
    assert_eq!(chunked.total_size_bytes, image.len() as u64);
    assert_eq!(
        chunked.complete_hash,
        obscura_crypto::attachment::sha256(&image).to_vec()
    );

    let bob_handle = bob.clone();
    wait_until("chunked reference to arrive", move || {
        bob_handle
            .messages()
            .conversation("alice")
            .is_ok_and(|m| !m.is_empty())
    })
    .await;

    let inbox = bob.messages().conversation("alice").unwrap();
    let MessageBody::Attachment(received) = &inbox[0].body else {
        panic!("expected an attachment message");
    };
    let downloaded = bob.download_attachment(received).await.unwrap();
    assert_eq!(downloaded.len(), image.len());
    assert_eq!(&downloaded[..3], &[0xFF, 0xD8, 0xFF]);
    assert_eq!(downloaded, image);
}

#[tokio::test]
async fn oversized_attachment_is_refused() {
    init_tracing();
    let server = TestServer::new();
    let (alice, _) = register_and_connect(&server, "alice").await;
    let (bob, _) = register_and_connect(&server, "bob").await;
    make_friends(&alice, "alice", &bob, "bob").await;

    let too_big = vec![0u8; 100 * 1024 * 1024 + 1];
    let err = alice
        .send_attachment("bob", &too_big, "application/octet-stream", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        obscura_core::CoreError::AttachmentTooLarge(_)
    ));
}
