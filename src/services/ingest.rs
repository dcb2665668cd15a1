//! IngestPipeline: writes an incoming byte stream as chunks and publishes
//! the catalog entry only once every chunk is durable.

use crate::{
    models::object::{ObjectEntry, ObjectId},
    services::{
        catalog::{CatalogError, truncate_to_millis},
        storage_service::StorageService,
    },
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut};
use std::io;
use thiserror::Error;
use tracing::{info, warn};

/// Attempts at drawing an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("could not allocate an unused object id after {0} attempts")]
    IdExhausted(usize),
}

pub type IngestResult<T> = Result<T, IngestError>;

pub struct IngestPipeline {
    store: StorageService,
}

impl IngestPipeline {
    pub fn new(store: StorageService) -> Self {
        Self { store }
    }

    /// Stream-ingest an object.
    ///
    /// - Re-windows the input into `chunk_size` chunks, written in sequence order.
    /// - Publishes the catalog entry after the last chunk is durable.
    /// - On any failure, removes the chunks written so far.
    ///
    /// `content_type` and `original_name` are stored verbatim.
    pub async fn ingest<S>(
        &self,
        content_type: &str,
        original_name: &str,
        stream: S,
    ) -> IngestResult<ObjectEntry>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut id = self.reserve_fresh_id().await?;

        let (size_bytes, chunk_count) = match self.write_chunks(&id, stream).await {
            Ok(written) => written,
            Err(err) => {
                self.discard(&id).await;
                return Err(err);
            }
        };

        let created_at = truncate_to_millis(self.store.clock.now());
        let mut attempt = 1;
        loop {
            let entry = ObjectEntry {
                id,
                size_bytes,
                content_type: content_type.to_string(),
                original_name: original_name.to_string(),
                created_at,
                redemption_count: 0,
            };

            match self.store.catalog.insert(&entry).await {
                Ok(()) => {
                    info!(%id, size_bytes, chunk_count, "ingested object");
                    self.store.trigger_sweep();
                    return Ok(entry);
                }
                Err(CatalogError::Conflict(_)) if attempt < MAX_ID_ATTEMPTS => {
                    warn!(%id, attempt, "object id collided in catalog, moving chunks to a new id");
                    id = self.move_to_fresh_id(id).await?;
                    attempt += 1;
                }
                Err(CatalogError::Conflict(_)) => {
                    self.discard(&id).await;
                    return Err(IngestError::IdExhausted(MAX_ID_ATTEMPTS));
                }
                Err(err) => {
                    self.discard(&id).await;
                    return Err(err.into());
                }
            }
        }
    }

    /// Draw ids until one has no chunk group yet.
    async fn reserve_fresh_id(&self) -> IngestResult<ObjectId> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = ObjectId::generate();
            if self.store.chunks.reserve(&id).await? {
                return Ok(id);
            }
            warn!(%id, "object id collided with an existing chunk group");
        }
        Err(IngestError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    async fn move_to_fresh_id(&self, current: ObjectId) -> IngestResult<ObjectId> {
        let next = match self.reserve_fresh_id().await {
            Ok(next) => next,
            Err(err) => {
                self.discard(&current).await;
                return Err(err);
            }
        };
        if let Err(err) = self.store.chunks.relocate(&current, &next).await {
            self.discard(&current).await;
            self.discard(&next).await;
            return Err(err.into());
        }
        Ok(next)
    }

    /// Returns total bytes and number of chunks written.
    async fn write_chunks<S>(&self, id: &ObjectId, stream: S) -> IngestResult<(i64, u32)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let chunk_size = self.store.settings.chunk_size.max(1);
        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut size_bytes: i64 = 0;
        let mut sequence: u32 = 0;

        pin_mut!(stream);
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            size_bytes += piece.len() as i64;
            buffer.extend_from_slice(&piece);
            while buffer.len() >= chunk_size {
                let chunk = buffer.split_to(chunk_size).freeze();
                self.put_chunk(id, &mut sequence, chunk).await?;
            }
        }
        if !buffer.is_empty() {
            self.put_chunk(id, &mut sequence, buffer.freeze()).await?;
        }

        Ok((size_bytes, sequence))
    }

    async fn put_chunk(&self, id: &ObjectId, sequence: &mut u32, chunk: Bytes) -> IngestResult<()> {
        self.store.chunks.put(id, *sequence, chunk).await?;
        *sequence = sequence
            .checked_add(1)
            .ok_or_else(|| io::Error::other("object exceeds the maximum chunk count"))?;
        Ok(())
    }

    /// Rollback of a failed ingest; the entry was never published.
    async fn discard(&self, id: &ObjectId) {
        if let Err(err) = self.store.chunks.delete_all(id).await {
            warn!(%id, error = %err, "failed to remove chunks of abandoned ingest");
        }
    }
}
