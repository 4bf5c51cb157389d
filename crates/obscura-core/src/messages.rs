//! Conversation-keyed message history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use obscura_protocol::types::AttachmentPointer;

use crate::error::CoreError;
use crate::storage::Storage;

pub const COL_MESSAGES: &str = "messages";
pub const COL_READ_MARKS: &str = "read_marks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum MessageBody {
    Text(String),
    Attachment(AttachmentPointer),
    /// Payload bytes that are not UTF-8 text, kept verbatim.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub timestamp: u64,
    pub body: MessageBody,
}

/// Message persistence over the storage capability. Keys embed the
/// zero-padded timestamp so a prefix scan yields chronological order.
pub struct MessageRepo {
    storage: Arc<dyn Storage>,
}

impl MessageRepo {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn append(&self, message: &StoredMessage) -> Result<(), CoreError> {
        let key = Self::key(&message.conversation_id, message.timestamp, &message.id);
        let data = serde_json::to_vec(message)
            .map_err(|e| CoreError::StorageIO(format!("serialize message: {e}")))?;
        self.storage.put(COL_MESSAGES, &key, &data)?;
        Ok(())
    }

    /// Append unless a message with the same id already exists in the
    /// conversation (sync paths redeliver).
    pub fn append_if_new(&self, message: &StoredMessage) -> Result<bool, CoreError> {
        if self.contains(&message.conversation_id, &message.id)? {
            return Ok(false);
        }
        self.append(message)?;
        Ok(true)
    }

    pub fn contains(&self, conversation_id: &str, message_id: &str) -> Result<bool, CoreError> {
        Ok(self
            .conversation(conversation_id)?
            .iter()
            .any(|m| m.id == message_id))
    }

    /// All messages in a conversation, oldest first.
    pub fn conversation(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, CoreError> {
        let prefix = format!("{conversation_id}/");
        let mut out = Vec::new();
        for (_, data) in self.storage.list(COL_MESSAGES, &prefix)? {
            out.push(
                serde_json::from_slice(&data)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt message: {e}")))?,
            );
        }
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<StoredMessage>, CoreError> {
        let mut out = Vec::new();
        for (_, data) in self.storage.list(COL_MESSAGES, "")? {
            out.push(
                serde_json::from_slice(&data)
                    .map_err(|e| CoreError::StorageIO(format!("corrupt message: {e}")))?,
            );
        }
        Ok(out)
    }

    /// Record that a conversation has been read up to `timestamp`.
    pub fn set_read_mark(&self, conversation_id: &str, timestamp: u64) -> Result<(), CoreError> {
        self.storage
            .put(COL_READ_MARKS, conversation_id, &timestamp.to_le_bytes())?;
        Ok(())
    }

    pub fn read_mark(&self, conversation_id: &str) -> Result<Option<u64>, CoreError> {
        match self.storage.get(COL_READ_MARKS, conversation_id)? {
            Some(data) => {
                let bytes: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoreError::StorageIO("corrupt read mark".into()))?;
                Ok(Some(u64::from_le_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn key(conversation_id: &str, timestamp: u64, message_id: &str) -> String {
        format!("{conversation_id}/{timestamp:020}/{message_id}")
    }
}

/// Decode inbound payload bytes: UTF-8 becomes text, anything else is
/// kept raw.
pub fn body_from_bytes(content: &[u8]) -> MessageBody {
    match std::str::from_utf8(content) {
        Ok(text) => MessageBody::Text(text.to_string()),
        Err(_) => MessageBody::Raw(content.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn repo() -> MessageRepo {
        MessageRepo::new(Arc::new(MemoryStorage::new()))
    }

    fn message(conversation: &str, id: &str, timestamp: u64) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            conversation_id: conversation.to_string(),
            direction: Direction::Inbound,
            timestamp,
            body: MessageBody::Text(format!("msg {id}")),
        }
    }

    #[test]
    fn conversation_is_chronological() {
        let repo = repo();
        repo.append(&message("bob", "b", 200)).unwrap();
        repo.append(&message("bob", "a", 100)).unwrap();
        repo.append(&message("alice", "x", 50)).unwrap();

        let bob = repo.conversation("bob").unwrap();
        assert_eq!(bob.len(), 2);
        assert_eq!(bob[0].id, "a");
        assert_eq!(bob[1].id, "b");
    }

    #[test]
    fn append_if_new_dedupes() {
        let repo = repo();
        assert!(repo.append_if_new(&message("bob", "m1", 100)).unwrap());
        assert!(!repo.append_if_new(&message("bob", "m1", 100)).unwrap());
        assert_eq!(repo.conversation("bob").unwrap().len(), 1);
    }

    #[test]
    fn read_marks_roundtrip() {
        let repo = repo();
        assert!(repo.read_mark("bob").unwrap().is_none());
        repo.set_read_mark("bob", 12345).unwrap();
        assert_eq!(repo.read_mark("bob").unwrap(), Some(12345));
    }

    #[test]
    fn body_decode_prefers_text() {
        assert_eq!(
            body_from_bytes(b"hello"),
            MessageBody::Text("hello".into())
        );
        assert_eq!(
            body_from_bytes(&[0xff, 0xfe]),
            MessageBody::Raw(vec![0xff, 0xfe])
        );
    }
}
