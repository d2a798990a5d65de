//! Chunk staging for in-progress transfer sessions.
//!
//! Every accepted chunk is stored as its own object keyed by its starting
//! offset. A retried chunk at the same offset overwrites the same object, and
//! reading a session back concatenates its chunks in offset order.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;

use crate::keys::{chunk_offset, staging_chunk_key, staging_prefix};
use crate::traits::{ByteStream, Storage, StorageError, StorageResult};

const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct StagingArea {
    storage: Arc<dyn Storage>,
}

impl StagingArea {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    #[tracing::instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn write_chunk(&self, session_id: &str, offset: u64, data: Bytes) -> StorageResult<()> {
        let key = staging_chunk_key(session_id, offset);
        self.storage.put(&key, data, CHUNK_CONTENT_TYPE).await?;
        Ok(())
    }

    /// Staged chunk keys for a session, in offset order.
    pub async fn chunk_keys(&self, session_id: &str) -> StorageResult<Vec<String>> {
        self.storage.list(&staging_prefix(session_id)).await
    }

    /// Stream the staged bytes of a session in offset order.
    ///
    /// Chunks must be contiguous from offset 0 and add up to `expected_size`.
    /// A gap, overlap or size mismatch ends the stream with
    /// [`StorageError::Inconsistent`] at the point it is detected. A session
    /// with no chunks at all is [`StorageError::NotFound`] unless it is empty.
    /// Only one chunk is held in memory at a time.
    #[tracing::instrument(skip(self))]
    pub async fn stream_all(&self, session_id: &str, expected_size: u64) -> StorageResult<ByteStream> {
        let keys = self.chunk_keys(session_id).await?;
        if keys.is_empty() && expected_size > 0 {
            return Err(StorageError::NotFound(staging_prefix(session_id)));
        }

        let state = Reassembly {
            storage: self.storage.clone(),
            keys: keys.into_iter(),
            current: None,
            assembled: 0,
            expected: expected_size,
        };
        Ok(Box::pin(futures::stream::try_unfold(state, Reassembly::next)))
    }

    /// Delete every staged chunk of a session. Returns the number of objects removed.
    #[tracing::instrument(skip(self))]
    pub async fn delete_all(&self, session_id: &str) -> StorageResult<usize> {
        let keys = self.chunk_keys(session_id).await?;
        for key in &keys {
            self.storage.delete(key).await?;
        }
        Ok(keys.len())
    }
}

struct Reassembly {
    storage: Arc<dyn Storage>,
    keys: std::vec::IntoIter<String>,
    current: Option<ByteStream>,
    assembled: u64,
    expected: u64,
}

impl Reassembly {
    async fn next(mut self) -> StorageResult<Option<(Bytes, Self)>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                match current.try_next().await? {
                    Some(data) => {
                        self.assembled += data.len() as u64;
                        if self.assembled > self.expected {
                            return Err(StorageError::Inconsistent(format!(
                                "staged data exceeds expected {} bytes",
                                self.expected
                            )));
                        }
                        return Ok(Some((data, self)));
                    }
                    None => self.current = None,
                }
            }

            let Some(key) = self.keys.next() else {
                if self.assembled != self.expected {
                    return Err(StorageError::Inconsistent(format!(
                        "assembled {} bytes, expected {}",
                        self.assembled, self.expected
                    )));
                }
                return Ok(None);
            };
            let offset = chunk_offset(&key).ok_or_else(|| {
                StorageError::Inconsistent(format!("unexpected object '{}' in staging", key))
            })?;
            if offset != self.assembled {
                return Err(StorageError::Inconsistent(format!(
                    "chunk at offset {} but {} bytes assembled",
                    offset, self.assembled
                )));
            }
            self.current = Some(self.storage.get_stream(&key).await?);
        }
    }
}
