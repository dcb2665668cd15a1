//! src/services/chunk_store.rs
//!
//! Chunk storage: an object's bytes as an ordered run of fixed-size files.
//! No lifecycle policy lives here. Payloads are sharded on disk beneath
//! `base_path/{shard}/{shard}/{id}/{sequence}.chunk`.

use crate::models::object::ObjectId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

const CHUNK_EXTENSION: &str = "chunk";
const RESERVE_ATTEMPTS: usize = 3;

/// A chunk group found on disk, used by orphan reclamation.
#[derive(Clone, Debug)]
pub struct ChunkGroup {
    pub id: ObjectId,
    pub modified_at: DateTime<Utc>,
}

/// Durable storage of chunked byte streams keyed by object id.
///
/// Every deleting operation is idempotent.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Claim an empty group for `id`. Returns `false` if the group already exists.
    async fn reserve(&self, id: &ObjectId) -> io::Result<bool>;

    /// Write chunk `sequence` of `id`. Chunks are immutable once written.
    async fn put(&self, id: &ObjectId, sequence: u32, bytes: Bytes) -> io::Result<()>;

    /// Lazy, single-pass stream of the chunks of `id` in sequence order.
    ///
    /// Ends at the first missing sequence number; a group that does not exist
    /// yields an empty stream.
    fn ordered_stream(&self, id: &ObjectId) -> BoxStream<'static, io::Result<Bytes>>;

    /// Remove every chunk of `id`. Succeeds if nothing is there.
    async fn delete_all(&self, id: &ObjectId) -> io::Result<()>;

    /// Move all chunks of `from` under `to`, which must have been reserved and still be empty.
    async fn relocate(&self, from: &ObjectId, to: &ObjectId) -> io::Result<()>;

    async fn chunk_count(&self, id: &ObjectId) -> io::Result<usize>;

    async fn list_groups(&self) -> io::Result<Vec<ChunkGroup>>;

    /// Write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> io::Result<()>;
}

/// Filesystem-backed [`ChunkStore`].
#[derive(Clone, Debug)]
pub struct DiskChunkStore {
    base_path: PathBuf,
}

impl DiskChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard for an id: first two bytes of MD5(id) as hex.
    fn shards(id: &ObjectId) -> (String, String) {
        let digest = md5::compute(id.to_string());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn group_path(&self, id: &ObjectId) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    fn chunk_path(group: &Path, sequence: u32) -> PathBuf {
        group.join(format!("{:08}.{}", sequence, CHUNK_EXTENSION))
    }

    /// Remove empty shard directories between `start` and `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
    async fn reserve(&self, id: &ObjectId) -> io::Result<bool> {
        let group = self.group_path(id);
        let parent = group
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("chunk group path missing parent directory"))?;

        // A concurrent prune can remove the shard directory between the two calls.
        let mut last_err = None;
        for _ in 0..RESERVE_ATTEMPTS {
            fs::create_dir_all(&parent).await?;
            match fs::create_dir(&group).await {
                Ok(()) => return Ok(true),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
                Err(err) if err.kind() == ErrorKind::NotFound => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::other("could not reserve chunk group")))
    }

    async fn put(&self, id: &ObjectId, sequence: u32, bytes: Bytes) -> io::Result<()> {
        let group = self.group_path(id);
        let tmp_path = group.join(format!(".tmp-{}", Uuid::new_v4()));
        let final_path = Self::chunk_path(&group, sequence);

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        result
    }

    fn ordered_stream(&self, id: &ObjectId) -> BoxStream<'static, io::Result<Bytes>> {
        let group = self.group_path(id);
        futures::stream::unfold(Some(0u32), move |next| {
            let group = group.clone();
            async move {
                let sequence = next?;
                match fs::read(Self::chunk_path(&group, sequence)).await {
                    Ok(bytes) => Some((Ok(Bytes::from(bytes)), sequence.checked_add(1))),
                    Err(err) if err.kind() == ErrorKind::NotFound => None,
                    Err(err) => Some((Err(err), None)),
                }
            }
        })
        .boxed()
    }

    async fn delete_all(&self, id: &ObjectId) -> io::Result<()> {
        let group = self.group_path(id);
        match fs::remove_dir_all(&group).await {
            Ok(()) => debug!("removed chunk group {}", group.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("chunk group {} already missing", group.display());
            }
            Err(err) => return Err(err),
        }
        if let Some(parent) = group.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn relocate(&self, from: &ObjectId, to: &ObjectId) -> io::Result<()> {
        let source = self.group_path(from);
        let target = self.group_path(to);
        fs::rename(&source, &target).await?;
        if let Some(parent) = source.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn chunk_count(&self, id: &ObjectId) -> io::Result<usize> {
        let mut entries = match fs::read_dir(self.group_path(id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == CHUNK_EXTENSION) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_groups(&self) -> io::Result<Vec<ChunkGroup>> {
        let mut groups = Vec::new();
        for shard_a in subdirectories(&self.base_path).await? {
            for shard_b in subdirectories(&shard_a).await? {
                for group in subdirectories(&shard_b).await? {
                    let Some(uuid) = group
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(|name| Uuid::try_parse(name).ok())
                    else {
                        continue;
                    };
                    let modified_at = match fs::metadata(&group).await {
                        Ok(meta) => DateTime::<Utc>::from(meta.modified()?),
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => return Err(err),
                    };
                    groups.push(ChunkGroup {
                        id: ObjectId::from_uuid(uuid),
                        modified_at,
                    });
                }
            }
        }
        Ok(groups)
    }

    async fn probe(&self) -> io::Result<()> {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        // best-effort cleanup
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(io::Error::other("file content mismatch"));
        }
        Ok(())
    }
}

/// Child directories of `dir`; a missing `dir` has none.
async fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}
