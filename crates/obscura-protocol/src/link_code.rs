//! One-shot device link codes.
//!
//! A new device encodes a signed challenge as a short-lived code the user
//! carries to an existing device. The approver verifies the signature and
//! expiry, and consumes the challenge exactly once.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use obscura_crypto::identity::RatchetIdentity;

use crate::error::ProtocolError;

/// Link codes expire five minutes after creation.
pub const LINK_CODE_TTL_MS: u64 = 5 * 60 * 1000;

const CHALLENGE_LEN: usize = 16;

/// JSON payload behind the base64 code. Field names are single letters to
/// keep codes short enough to type.
#[derive(Debug, Serialize, Deserialize)]
struct LinkCodePayload {
    /// Server user id of the new device.
    i: String,
    /// Device username of the new device.
    u: String,
    /// Ratchet identity public key, base64.
    k: String,
    /// Random 16-byte challenge, base64.
    c: String,
    /// Ed25519 signature over the challenge, base64.
    s: String,
    /// Expiry, ms epoch.
    e: u64,
}

/// A parsed link code, pre-verification.
#[derive(Debug, Clone)]
pub struct LinkCode {
    pub server_user_id: String,
    pub device_username: String,
    pub identity_key: Vec<u8>,
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
    pub expires_at: u64,
}

/// Create a link code for this device, returning the code string and the
/// challenge bytes the approval must echo.
pub fn create_link_code(
    identity: &RatchetIdentity,
    server_user_id: &str,
    device_username: &str,
    now_ms: u64,
) -> Result<(String, Vec<u8>), ProtocolError> {
    use rand::RngCore as _;

    let mut challenge = vec![0u8; CHALLENGE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    let signature = identity.sign(&challenge);

    let payload = LinkCodePayload {
        i: server_user_id.to_string(),
        u: device_username.to_string(),
        k: base64::engine::general_purpose::STANDARD.encode(identity.public_key_bytes()),
        c: base64::engine::general_purpose::STANDARD.encode(&challenge),
        s: base64::engine::general_purpose::STANDARD.encode(signature),
        e: now_ms + LINK_CODE_TTL_MS,
    };
    let json = serde_json::to_vec(&payload)
        .map_err(|e| ProtocolError::Codec(format!("encode link code: {e}")))?;
    let code = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&json);
    Ok((code, challenge))
}

/// Parse a link code without verifying it.
pub fn parse_link_code(code: &str) -> Result<LinkCode, ProtocolError> {
    let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(code.trim())
        .map_err(|e| ProtocolError::LinkMalformed(format!("invalid base64: {e}")))?;
    let payload: LinkCodePayload = serde_json::from_slice(&json)
        .map_err(|e| ProtocolError::LinkMalformed(format!("invalid JSON: {e}")))?;

    let decode_field = |name: &str, value: &str| {
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| ProtocolError::LinkMalformed(format!("invalid {name}: {e}")))
    };
    Ok(LinkCode {
        server_user_id: payload.i,
        device_username: payload.u,
        identity_key: decode_field("identity key", &payload.k)?,
        challenge: decode_field("challenge", &payload.c)?,
        signature: decode_field("signature", &payload.s)?,
        expires_at: payload.e,
    })
}

impl LinkCode {
    /// Check expiry and the challenge signature.
    ///
    /// The one-shot challenge check is the approver side: it holds the
    /// in-memory set of consumed challenges.
    pub fn verify(&self, now_ms: u64) -> Result<(), ProtocolError> {
        if now_ms > self.expires_at {
            return Err(ProtocolError::LinkExpired);
        }
        if self.challenge.len() != CHALLENGE_LEN {
            return Err(ProtocolError::LinkMalformed(format!(
                "challenge must be {CHALLENGE_LEN} bytes"
            )));
        }
        RatchetIdentity::verify(&self.identity_key, &self.challenge, &self.signature)
            .map_err(|e| ProtocolError::LinkBadSignature(e.to_string()))
    }
}
