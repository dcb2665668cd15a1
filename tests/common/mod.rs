#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use ephemeral_store::{
    db,
    models::object::{ObjectEntry, ObjectId},
    services::{
        catalog::{ObjectCatalog, truncate_to_millis},
        chunk_store::{ChunkGroup, ChunkStore, DiskChunkStore},
        clock::{Clock, ManualClock},
        delivery::Delivery,
        storage_service::{StorageService, StoreSettings},
    },
};
use futures::{Stream, StreamExt, stream::BoxStream};
use std::{
    io,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

pub struct TestStore {
    pub service: StorageService,
    pub clock: ManualClock,
    pub disk: Arc<DiskChunkStore>,
    _dir: TempDir,
}

pub fn settings(chunk_size: usize) -> StoreSettings {
    StoreSettings {
        retention_window: Duration::from_secs(20 * 60),
        chunk_size,
        sweep_interval: Duration::from_secs(60),
    }
}

pub async fn test_store(settings: StoreSettings) -> TestStore {
    test_store_wrapping(settings, |disk| disk as Arc<dyn ChunkStore>).await
}

/// Build a store whose chunk store is `wrap(disk)`; `disk` stays reachable for assertions.
pub async fn test_store_wrapping<F>(settings: StoreSettings, wrap: F) -> TestStore
where
    F: FnOnce(Arc<DiskChunkStore>) -> Arc<dyn ChunkStore>,
{
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}", dir.path().join("meta/catalog.db").display());
    let pool = db::connect(&db_url, 8).await.unwrap();
    db::run_migrations(&pool).await.unwrap();

    let disk = Arc::new(DiskChunkStore::new(dir.path().join("chunks")));
    let clock = ManualClock::new(Utc::now());
    let service = StorageService::new(
        Arc::new(pool),
        wrap(disk.clone()),
        Arc::new(clock.clone()),
        settings,
    );

    TestStore {
        service,
        clock,
        disk,
        _dir: dir,
    }
}

impl TestStore {
    /// Wait for any opportunistic sweep to finish so it cannot interleave with the test.
    pub async fn settle(&self) {
        while self.service.sweep_in_flight() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.service.clock.now()
    }

    pub fn advance(&self, by: TimeDelta) {
        self.clock.advance(by);
    }

    pub async fn is_gone(&self, id: &ObjectId) -> bool {
        self.service.catalog.get(id).await.unwrap().is_none()
            && self.disk.chunk_count(id).await.unwrap() == 0
    }

    /// Poll `is_gone` for cleanups that run on a spawned task.
    pub async fn eventually_gone(&self, id: &ObjectId) -> bool {
        for _ in 0..100 {
            if self.is_gone(id).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// `data` as a body stream split into `piece`-sized items.
pub fn body_stream(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let pieces: Vec<io::Result<Bytes>> = data
        .chunks(piece.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    futures::stream::iter(pieces)
}

pub async fn read_all(delivery: Delivery) -> io::Result<Vec<u8>> {
    let mut body = delivery.body;
    let mut out = Vec::new();
    while let Some(bytes) = body.next().await {
        out.extend_from_slice(&bytes?);
    }
    Ok(out)
}

/// Chunk store that fails every `put` from sequence `fail_from` on.
pub struct FailingChunkStore {
    pub inner: Arc<DiskChunkStore>,
    pub fail_from: u32,
}

#[async_trait]
impl ChunkStore for FailingChunkStore {
    async fn reserve(&self, id: &ObjectId) -> io::Result<bool> {
        self.inner.reserve(id).await
    }

    async fn put(&self, id: &ObjectId, sequence: u32, bytes: Bytes) -> io::Result<()> {
        if sequence >= self.fail_from {
            return Err(io::Error::other("injected chunk write failure"));
        }
        self.inner.put(id, sequence, bytes).await
    }

    fn ordered_stream(&self, id: &ObjectId) -> BoxStream<'static, io::Result<Bytes>> {
        self.inner.ordered_stream(id)
    }

    async fn delete_all(&self, id: &ObjectId) -> io::Result<()> {
        self.inner.delete_all(id).await
    }

    async fn relocate(&self, from: &ObjectId, to: &ObjectId) -> io::Result<()> {
        self.inner.relocate(from, to).await
    }

    async fn chunk_count(&self, id: &ObjectId) -> io::Result<usize> {
        self.inner.chunk_count(id).await
    }

    async fn list_groups(&self) -> io::Result<Vec<ChunkGroup>> {
        self.inner.list_groups().await
    }

    async fn probe(&self) -> io::Result<()> {
        self.inner.probe().await
    }
}

/// Chunk store that records every reserved id and, for the first
/// `collisions` of them, plants a catalog row under the same id so the
/// ingest that reserved it hits a catalog conflict.
pub struct CollidingChunkStore {
    pub inner: Arc<DiskChunkStore>,
    pub catalog: OnceLock<ObjectCatalog>,
    pub collisions: AtomicUsize,
    pub reserved: Mutex<Vec<ObjectId>>,
}

impl CollidingChunkStore {
    pub fn new(inner: Arc<DiskChunkStore>, collisions: usize) -> Self {
        Self {
            inner,
            catalog: OnceLock::new(),
            collisions: AtomicUsize::new(collisions),
            reserved: Mutex::new(Vec::new()),
        }
    }

    pub fn reserved(&self) -> Vec<ObjectId> {
        self.reserved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkStore for CollidingChunkStore {
    async fn reserve(&self, id: &ObjectId) -> io::Result<bool> {
        let fresh = self.inner.reserve(id).await?;
        self.reserved.lock().unwrap().push(*id);
        let collide = self
            .collisions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if collide {
            let planted = ObjectEntry {
                id: *id,
                size_bytes: 0,
                content_type: "application/octet-stream".into(),
                original_name: "planted".into(),
                created_at: truncate_to_millis(Utc::now()),
                redemption_count: 0,
            };
            let catalog = self.catalog.get().expect("catalog not attached");
            catalog.insert(&planted).await.expect("planting colliding entry");
        }
        Ok(fresh)
    }

    async fn put(&self, id: &ObjectId, sequence: u32, bytes: Bytes) -> io::Result<()> {
        self.inner.put(id, sequence, bytes).await
    }

    fn ordered_stream(&self, id: &ObjectId) -> BoxStream<'static, io::Result<Bytes>> {
        self.inner.ordered_stream(id)
    }

    async fn delete_all(&self, id: &ObjectId) -> io::Result<()> {
        self.inner.delete_all(id).await
    }

    async fn relocate(&self, from: &ObjectId, to: &ObjectId) -> io::Result<()> {
        self.inner.relocate(from, to).await
    }

    async fn chunk_count(&self, id: &ObjectId) -> io::Result<usize> {
        self.inner.chunk_count(id).await
    }

    async fn list_groups(&self) -> io::Result<Vec<ChunkGroup>> {
        self.inner.list_groups().await
    }

    async fn probe(&self) -> io::Result<()> {
        self.inner.probe().await
    }
}

/// Chunk store whose first `list_groups` call panics.
pub struct PanickingChunkStore {
    pub inner: Arc<DiskChunkStore>,
    pub panicked: AtomicBool,
}

#[async_trait]
impl ChunkStore for PanickingChunkStore {
    async fn reserve(&self, id: &ObjectId) -> io::Result<bool> {
        self.inner.reserve(id).await
    }

    async fn put(&self, id: &ObjectId, sequence: u32, bytes: Bytes) -> io::Result<()> {
        self.inner.put(id, sequence, bytes).await
    }

    fn ordered_stream(&self, id: &ObjectId) -> BoxStream<'static, io::Result<Bytes>> {
        self.inner.ordered_stream(id)
    }

    async fn delete_all(&self, id: &ObjectId) -> io::Result<()> {
        self.inner.delete_all(id).await
    }

    async fn relocate(&self, from: &ObjectId, to: &ObjectId) -> io::Result<()> {
        self.inner.relocate(from, to).await
    }

    async fn chunk_count(&self, id: &ObjectId) -> io::Result<usize> {
        self.inner.chunk_count(id).await
    }

    async fn list_groups(&self) -> io::Result<Vec<ChunkGroup>> {
        if !self.panicked.swap(true, Ordering::AcqRel) {
            panic!("chunk listing blew up");
        }
        self.inner.list_groups().await
    }

    async fn probe(&self) -> io::Result<()> {
        self.inner.probe().await
    }
}
