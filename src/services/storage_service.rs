//! src/services/storage_service.rs
//!
//! StorageService: the shared handle over the chunk store, the SQLite
//! catalog and the lifecycle policy. Handlers receive it as axum state and
//! the pipelines are built from it. It also owns `purge`, the single
//! idempotent delete that delivery, sweeping and ingest rollback all use.

use crate::{
    models::object::{ObjectEntry, ObjectId},
    services::{
        catalog::{CatalogError, ObjectCatalog},
        chunk_store::{ChunkStore, DEFAULT_CHUNK_SIZE},
        clock::Clock,
        delivery::{Delivery, DeliveryPipeline, DeliveryResult},
        ingest::{IngestPipeline, IngestResult},
        lifecycle::{DEFAULT_RETENTION, LifecyclePolicy},
        sweeper::ReclamationSweeper,
    },
};
use bytes::Bytes;
use futures::Stream;
use sqlx::SqlitePool;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Default cadence of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Tunables recognised by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    /// Retention window `T` for unredeemed objects.
    pub retention_window: Duration,
    /// Bytes per stored chunk.
    pub chunk_size: usize,
    /// Pause between background sweeps.
    pub sweep_interval: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            retention_window: DEFAULT_RETENTION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct StorageService {
    pub catalog: ObjectCatalog,
    pub chunks: Arc<dyn ChunkStore>,
    pub policy: LifecyclePolicy,
    pub clock: Arc<dyn Clock>,
    pub settings: StoreSettings,
    /// Set while an opportunistic sweep is in flight.
    sweep_in_flight: Arc<AtomicBool>,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        chunks: Arc<dyn ChunkStore>,
        clock: Arc<dyn Clock>,
        settings: StoreSettings,
    ) -> Self {
        let policy = LifecyclePolicy::new(settings.retention_window);
        Self {
            catalog: ObjectCatalog::new(db, policy),
            chunks,
            policy,
            clock,
            settings,
            sweep_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ingest_pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(self.clone())
    }

    pub fn delivery_pipeline(&self) -> DeliveryPipeline {
        DeliveryPipeline::new(self.clone())
    }

    pub fn sweeper(&self) -> ReclamationSweeper {
        ReclamationSweeper::new(self.clone(), self.settings.sweep_interval)
    }

    /// Store `stream` as a new object; see [`IngestPipeline::ingest`].
    pub async fn ingest<S>(
        &self,
        content_type: &str,
        original_name: &str,
        stream: S,
    ) -> IngestResult<ObjectEntry>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ingest_pipeline()
            .ingest(content_type, original_name, stream)
            .await
    }

    /// Redeem a reference; see [`DeliveryPipeline::redeem`].
    pub async fn redeem(&self, reference: &str) -> DeliveryResult<Delivery> {
        self.delivery_pipeline().redeem(reference).await
    }

    /// Delete an object's catalog entry, then its chunks.
    ///
    /// Removing the entry first means no reader can find an entry whose
    /// chunks are already gone. Repeating the call on a purged id is a no-op.
    pub async fn purge(&self, id: &ObjectId) -> StorageResult<()> {
        let removed = self.catalog.delete(id).await?;
        self.chunks.delete_all(id).await?;
        debug!(%id, removed, "purged object");
        Ok(())
    }

    /// [`purge`](Self::purge) for callers that have already committed to an outcome.
    pub async fn purge_best_effort(&self, id: &ObjectId) {
        if let Err(err) = self.purge(id).await {
            warn!(%id, error = %err, "failed to purge object");
        }
    }

    /// Whether an opportunistic sweep started by [`trigger_sweep`](Self::trigger_sweep) is running.
    pub fn sweep_in_flight(&self) -> bool {
        self.sweep_in_flight.load(Ordering::Acquire)
    }

    /// Start a sweep in the background unless one is already running.
    pub fn trigger_sweep(&self) {
        if self.sweep_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let service = self.clone();
        let in_flight = InFlight(self.sweep_in_flight.clone());
        tokio::spawn(async move {
            let _in_flight = in_flight;
            if let Err(err) = service.sweeper().sweep_once().await {
                warn!(error = %err, "opportunistic sweep failed");
            }
        });
    }
}

/// Clears the sweep flag when dropped, including when the sweep task panics.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
