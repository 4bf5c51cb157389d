//! Envelope and gateway frame formats.
//!
//! The encrypted message body posted to the server is a fixed binary
//! layout (`type || length || content`); gateway frames are length-prefixed
//! JSON so the union stays extensible.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A session ciphertext with its ratchet tag, as posted to a user's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    /// Ratchet ciphertext tag (PREKEY or ENCRYPTED wire value).
    #[serde(rename = "type")]
    pub message_type: u32,
    pub content: Vec<u8>,
}

/// A server-queued message addressed to this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Server-assigned id; echoing it in an ACK dequeues the envelope.
    pub id: String,
    pub source_user_id: String,
    pub message: EncryptedMessage,
}

/// The gateway frame union. The server sends envelopes and ACK echoes;
/// the client only ever sends ACKs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "data", rename_all = "camelCase")]
pub enum GatewayFrame {
    Envelope(Envelope),
    Ack { message_id: String },
}

/// Encode an [`EncryptedMessage`] as `type (u32 LE) || length (u32 LE) ||
/// content`, the POST body format.
pub fn encode_message(message: &EncryptedMessage) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(message.content.len())
        .map_err(|_| ProtocolError::Codec("message content too large".into()))?;
    let mut out = Vec::with_capacity(8 + message.content.len());
    out.extend_from_slice(&message.message_type.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&message.content);
    Ok(out)
}

/// Decode the POST body format produced by [`encode_message`].
pub fn decode_message(data: &[u8]) -> Result<EncryptedMessage, ProtocolError> {
    if data.len() < 8 {
        return Err(ProtocolError::Codec("encrypted message too short".into()));
    }
    let message_type = u32::from_le_bytes(
        data[..4]
            .try_into()
            .map_err(|_| ProtocolError::Codec("invalid type".into()))?,
    );
    let len = u32::from_le_bytes(
        data[4..8]
            .try_into()
            .map_err(|_| ProtocolError::Codec("invalid length".into()))?,
    ) as usize;
    if data.len() != 8 + len {
        return Err(ProtocolError::Codec(format!(
            "encrypted message length mismatch: header says {len}, body has {}",
            data.len() - 8
        )));
    }
    Ok(EncryptedMessage {
        message_type,
        content: data[8..].to_vec(),
    })
}

/// Encode a gateway frame with its u32 LE length prefix.
pub fn encode_frame(frame: &GatewayFrame) -> Result<Vec<u8>, ProtocolError> {
    let body =
        serde_json::to_vec(frame).map_err(|e| ProtocolError::Frame(format!("encode: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| ProtocolError::Frame("frame too large".into()))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one length-prefixed frame from the front of `data`.
///
/// Returns the frame and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode_frame(data: &[u8]) -> Result<Option<(GatewayFrame, usize)>, ProtocolError> {
    if data.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes(
        data[..4]
            .try_into()
            .map_err(|_| ProtocolError::Frame("invalid length prefix".into()))?,
    ) as usize;
    if data.len() < 4 + len {
        return Ok(None);
    }
    let frame = serde_json::from_slice(&data[4..4 + len])
        .map_err(|e| ProtocolError::Frame(format!("decode: {e}")))?;
    Ok(Some((frame, 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let message = EncryptedMessage {
            message_type: 3,
            content: vec![1, 2, 3, 4],
        };
        let encoded = encode_message(&message).unwrap();
        assert_eq!(decode_message(&encoded).unwrap(), message);
    }

    #[test]
    fn message_length_mismatch_is_rejected() {
        let message = EncryptedMessage {
            message_type: 1,
            content: vec![9; 16],
        };
        let mut encoded = encode_message(&message).unwrap();
        encoded.pop();
        assert!(decode_message(&encoded).is_err());
    }

    #[test]
    fn frame_roundtrip() {
        let frame = GatewayFrame::Envelope(Envelope {
            id: "env-1".into(),
            source_user_id: "alice".into(),
            message: EncryptedMessage {
                message_type: 1,
                content: vec![7, 7, 7],
            },
        });
        let encoded = encode_frame(&frame).unwrap();
        let (decoded, consumed) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn partial_frame_yields_none() {
        let frame = GatewayFrame::Ack {
            message_id: "env-1".into(),
        };
        let encoded = encode_frame(&frame).unwrap();
        assert!(decode_frame(&encoded[..encoded.len() - 1]).unwrap().is_none());
        assert!(decode_frame(&encoded[..2]).unwrap().is_none());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = GatewayFrame::Ack { message_id: "a".into() };
        let b = GatewayFrame::Ack { message_id: "b".into() };
        let mut buffer = encode_frame(&a).unwrap();
        buffer.extend_from_slice(&encode_frame(&b).unwrap());

        let (first, consumed) = decode_frame(&buffer).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, _) = decode_frame(&buffer[consumed..]).unwrap().unwrap();
        assert_eq!(second, b);
    }
}
