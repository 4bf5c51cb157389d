//! Attachment transfer: single-blob and chunked upload/download with
//! pacing, bounded retries, and an optional cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use obscura_crypto::attachment::{open_blob, seal_blob, sha256};
use obscura_protocol::transport::{ServerApi, MAX_BLOB_BYTES, MAX_CHUNKED_BYTES};
use obscura_protocol::types::{
    AttachmentPointer, ChunkRef, ChunkedContentReference, ContentReference,
};

use crate::error::CoreError;
use crate::storage::Storage;

pub const COL_ATTACHMENT_CACHE: &str = "attachment_cache";

/// Sequential pacer: at most N chunk requests per second, with a spacing
/// floor of 1050/N ms between consecutive requests.
struct ChunkPacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl ChunkPacer {
    fn new(chunks_per_second: u32) -> Self {
        let chunks_per_second = chunks_per_second.max(1);
        Self {
            min_interval: Duration::from_millis(u64::from(1050 / chunks_per_second)),
            last: None,
        }
    }

    async fn pace(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Uploads and downloads attachments through the server blob store.
pub struct AttachmentManager {
    server: Arc<dyn ServerApi>,
    /// `None` disables the cache entirely.
    cache: Option<Arc<dyn Storage>>,
    pacer: tokio::sync::Mutex<ChunkPacer>,
}

impl AttachmentManager {
    pub fn new(
        server: Arc<dyn ServerApi>,
        cache: Option<Arc<dyn Storage>>,
        chunks_per_second: u32,
    ) -> Self {
        Self {
            server,
            cache,
            pacer: tokio::sync::Mutex::new(ChunkPacer::new(chunks_per_second)),
        }
    }

    /// Encrypt and upload a plaintext, choosing single-blob or chunked
    /// mode by size.
    pub async fn upload(
        &self,
        plaintext: &[u8],
        content_type: &str,
        file_name: Option<String>,
    ) -> Result<AttachmentPointer, CoreError> {
        if plaintext.len() > MAX_CHUNKED_BYTES {
            return Err(CoreError::AttachmentTooLarge(plaintext.len()));
        }
        if plaintext.len() <= MAX_BLOB_BYTES {
            let reference = self.upload_single(plaintext, content_type).await?;
            self.cache_put(&format!("blob:{}", reference.attachment_id), plaintext);
            return Ok(AttachmentPointer::Single(reference));
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let mut chunks = Vec::new();
        for (index, chunk) in plaintext.chunks(MAX_BLOB_BYTES).enumerate() {
            self.pacer.lock().await.pace().await;
            let reference = self.upload_single(chunk, content_type).await?;
            chunks.push(ChunkRef {
                index: u32::try_from(index)
                    .map_err(|_| CoreError::Transfer("chunk index overflow".into()))?,
                attachment_id: reference.attachment_id,
                content_key: reference.content_key,
                nonce: reference.nonce,
                chunk_hash: reference.content_hash,
                size: reference.size_bytes,
            });
        }

        let reference = ChunkedContentReference {
            file_id: file_id.clone(),
            chunks,
            complete_hash: sha256(plaintext).to_vec(),
            content_type: content_type.to_string(),
            total_size_bytes: plaintext.len() as u64,
            file_name,
        };
        self.cache_put(&format!("file:{file_id}"), plaintext);
        Ok(AttachmentPointer::Chunked(reference))
    }

    /// Download and decrypt an attachment, verifying every hash.
    pub async fn download(&self, pointer: &AttachmentPointer) -> Result<Vec<u8>, CoreError> {
        match pointer {
            AttachmentPointer::Single(reference) => self.download_single(reference).await,
            AttachmentPointer::Chunked(reference) => self.download_chunked(reference).await,
        }
    }

    async fn upload_single(
        &self,
        plaintext: &[u8],
        content_type: &str,
    ) -> Result<ContentReference, CoreError> {
        let sealed = seal_blob(plaintext)?;
        // One retry per blob; a second failure aborts the whole transfer.
        let receipt = match self.server.put_attachment(sealed.ciphertext.clone()).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!(error = %e, "attachment PUT failed, retrying once");
                self.server.put_attachment(sealed.ciphertext.clone()).await?
            }
        };
        Ok(ContentReference {
            attachment_id: receipt.id,
            content_key: sealed.content_key.to_vec(),
            nonce: sealed.nonce.to_vec(),
            content_hash: sealed.content_hash.to_vec(),
            content_type: content_type.to_string(),
            size_bytes: sealed.size_bytes,
            expires_at: receipt.expires_at,
        })
    }

    async fn download_single(&self, reference: &ContentReference) -> Result<Vec<u8>, CoreError> {
        let cache_key = format!("blob:{}", reference.attachment_id);
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached);
        }

        let ciphertext = self.fetch_blob(&reference.attachment_id).await?;
        let plaintext = open_blob(
            &ciphertext,
            &reference.content_key,
            &reference.nonce,
            &reference.content_hash,
        )?;
        self.cache_put(&cache_key, &plaintext);
        Ok(plaintext)
    }

    async fn download_chunked(
        &self,
        reference: &ChunkedContentReference,
    ) -> Result<Vec<u8>, CoreError> {
        let file_key = format!("file:{}", reference.file_id);
        if let Some(cached) = self.cache_get(&file_key) {
            self.prune_chunk_entries(reference);
            return Ok(cached);
        }

        // Reassembly is by index, whatever order the list arrived in.
        let mut chunks: Vec<&ChunkRef> = reference.chunks.iter().collect();
        chunks.sort_by_key(|c| c.index);

        let mut assembled = Vec::with_capacity(
            usize::try_from(reference.total_size_bytes).unwrap_or_default(),
        );
        for chunk in chunks {
            let chunk_key = format!("chunk:{}", chunk.attachment_id);
            let plaintext = if let Some(cached) = self.cache_get(&chunk_key) {
                cached
            } else {
                self.pacer.lock().await.pace().await;
                let ciphertext = self.fetch_blob(&chunk.attachment_id).await?;
                let plaintext =
                    open_blob(&ciphertext, &chunk.content_key, &chunk.nonce, &chunk.chunk_hash)?;
                self.cache_put(&chunk_key, &plaintext);
                plaintext
            };
            assembled.extend_from_slice(&plaintext);
        }

        if sha256(&assembled).to_vec() != reference.complete_hash {
            return Err(CoreError::Crypto(
                obscura_crypto::CryptoError::IntegrityFail("chunked complete hash".into()),
            ));
        }

        self.cache_put(&file_key, &assembled);
        self.prune_chunk_entries(reference);
        Ok(assembled)
    }

    async fn fetch_blob(&self, attachment_id: &str) -> Result<Vec<u8>, CoreError> {
        match self.server.get_attachment(attachment_id).await {
            Ok(data) => Ok(data),
            Err(e) => {
                tracing::warn!(error = %e, id = %attachment_id, "attachment GET failed, retrying once");
                Ok(self.server.get_attachment(attachment_id).await?)
            }
        }
    }

    fn prune_chunk_entries(&self, reference: &ChunkedContentReference) {
        let Some(cache) = &self.cache else { return };
        for chunk in &reference.chunks {
            if let Err(e) =
                cache.delete(COL_ATTACHMENT_CACHE, &format!("chunk:{}", chunk.attachment_id))
            {
                tracing::debug!(error = %e, "chunk cache prune failed");
            }
        }
    }

    fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache
            .as_ref()
            .and_then(|c| c.get(COL_ATTACHMENT_CACHE, key).ok().flatten())
    }

    fn cache_put(&self, key: &str, value: &[u8]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(COL_ATTACHMENT_CACHE, key, value) {
                tracing::debug!(error = %e, "attachment cache write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_interval_follows_rate() {
        let pacer = ChunkPacer::new(4);
        assert_eq!(pacer.min_interval, Duration::from_millis(262));
        let pacer = ChunkPacer::new(1);
        assert_eq!(pacer.min_interval, Duration::from_millis(1050));
    }
}
