//! In-process server double for integration tests.
//!
//! Real storage, real crypto, real frame encoding; only the network is
//! replaced. Prekey bundles consume one-time prekeys like the real
//! backend, envelopes queue per user until ACKed, and gateway frames
//! round-trip through the wire codec.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use obscura_protocol::gateway::{Gateway, GatewayConnection};
use obscura_protocol::transport::{
    AttachmentReceipt, PreKeyBundleResponse, PreKeyDto, PreKeyUpload, ServerApi, SignedPreKeyDto,
    MAX_BLOB_BYTES,
};
use obscura_protocol::wire::{decode_frame, encode_frame, EncryptedMessage, Envelope, GatewayFrame};
use obscura_protocol::ProtocolError;

#[derive(Default)]
struct UserState {
    identity_key: Vec<u8>,
    registration_id: u32,
    signed_pre_key: Option<SignedPreKeyDto>,
    one_time_pre_keys: Vec<PreKeyDto>,
    pending: Vec<Envelope>,
    live: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct ServerState {
    users: HashMap<String, UserState>,
    attachments: HashMap<String, Vec<u8>>,
    counter: u64,
}

/// The shared in-memory backend. Clone a handle per test client.
#[derive(Clone, Default)]
pub struct TestServer {
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The request/response surface as seen by `user_id`.
    pub fn api_for(&self, user_id: &str) -> Arc<dyn ServerApi> {
        Arc::new(TestServerApi {
            state: self.state.clone(),
            user_id: user_id.to_string(),
        })
    }

    /// The gateway as seen by `user_id`.
    pub fn gateway_for(&self, user_id: &str) -> Arc<dyn Gateway> {
        Arc::new(TestGateway {
            state: self.state.clone(),
            user_id: user_id.to_string(),
        })
    }

    /// Unacknowledged envelopes queued for a user.
    pub fn pending_count(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .users
            .get(user_id)
            .map_or(0, |u| u.pending.len())
    }

    /// One-time prekeys a user still has on the server.
    pub fn prekey_count(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .users
            .get(user_id)
            .map_or(0, |u| u.one_time_pre_keys.len())
    }
}

struct TestServerApi {
    state: Arc<Mutex<ServerState>>,
    /// The authenticated caller.
    user_id: String,
}

#[async_trait]
impl ServerApi for TestServerApi {
    async fn fetch_prekey_bundle(
        &self,
        user_id: &str,
    ) -> Result<PreKeyBundleResponse, ProtocolError> {
        let mut state = self.state.lock();
        let user = state
            .users
            .get_mut(user_id)
            .filter(|u| u.signed_pre_key.is_some())
            .ok_or(ProtocolError::TransportStatus {
                status: 404,
                message: format!("no prekeys for {user_id}"),
            })?;
        let pre_key = if user.one_time_pre_keys.is_empty() {
            None
        } else {
            Some(user.one_time_pre_keys.remove(0))
        };
        Ok(PreKeyBundleResponse {
            identity_key: user.identity_key.clone(),
            registration_id: user.registration_id,
            signed_pre_key: user
                .signed_pre_key
                .clone()
                .ok_or_else(|| ProtocolError::TransportIO("signed prekey vanished".into()))?,
            pre_key,
        })
    }

    async fn upload_prekeys(&self, upload: PreKeyUpload) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let user = state.users.entry(self.user_id.clone()).or_default();
        user.identity_key = upload.identity_key;
        user.registration_id = upload.registration_id;
        if let Some(signed) = upload.signed_pre_key {
            user.signed_pre_key = Some(signed);
        }
        user.one_time_pre_keys.extend(upload.one_time_pre_keys);
        Ok(())
    }

    async fn post_message(
        &self,
        user_id: &str,
        message: &EncryptedMessage,
    ) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.counter += 1;
        let envelope = Envelope {
            id: format!("env-{}", state.counter),
            source_user_id: self.user_id.clone(),
            message: message.clone(),
        };
        let user = state.users.entry(user_id.to_string()).or_default();
        user.pending.push(envelope.clone());
        if let Some(live) = user.live.clone() {
            let frame = encode_frame(&GatewayFrame::Envelope(envelope))?;
            if live.send(frame).is_err() {
                user.live = None;
            }
        }
        Ok(())
    }

    async fn put_attachment(&self, data: Vec<u8>) -> Result<AttachmentReceipt, ProtocolError> {
        if data.len() > MAX_BLOB_BYTES + 1024 {
            // Ciphertext overhead allowance over the plaintext cap.
            return Err(ProtocolError::TransportStatus {
                status: 413,
                message: format!("blob too large: {} bytes", data.len()),
            });
        }
        let mut state = self.state.lock();
        state.counter += 1;
        let id = format!("att-{}", state.counter);
        state.attachments.insert(id.clone(), data);
        Ok(AttachmentReceipt {
            id,
            expires_at: None,
        })
    }

    async fn get_attachment(&self, id: &str) -> Result<Vec<u8>, ProtocolError> {
        self.state
            .lock()
            .attachments
            .get(id)
            .cloned()
            .ok_or(ProtocolError::TransportStatus {
                status: 404,
                message: format!("no attachment {id}"),
            })
    }
}

struct TestGateway {
    state: Arc<Mutex<ServerState>>,
    user_id: String,
}

#[async_trait]
impl Gateway for TestGateway {
    async fn connect(&self) -> Result<Box<dyn GatewayConnection>, ProtocolError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            let user = state.users.entry(self.user_id.clone()).or_default();
            // Replay everything still unacknowledged, then go live.
            for envelope in &user.pending {
                let frame = encode_frame(&GatewayFrame::Envelope(envelope.clone()))?;
                let _ = tx.send(frame);
            }
            user.live = Some(tx);
        }
        Ok(Box::new(TestConnection {
            state: self.state.clone(),
            user_id: self.user_id.clone(),
            rx,
        }))
    }
}

struct TestConnection {
    state: Arc<Mutex<ServerState>>,
    user_id: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl GatewayConnection for TestConnection {
    async fn next_frame(&mut self) -> Result<Option<GatewayFrame>, ProtocolError> {
        let Some(bytes) = self.rx.recv().await else {
            return Ok(None);
        };
        let (frame, _) = decode_frame(&bytes)?
            .ok_or_else(|| ProtocolError::Frame("truncated frame".into()))?;
        Ok(Some(frame))
    }

    async fn send_ack(&mut self, message_id: &str) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        if let Some(user) = state.users.get_mut(&self.user_id) {
            user.pending.retain(|e| e.id != message_id);
        }
        Ok(())
    }
}
