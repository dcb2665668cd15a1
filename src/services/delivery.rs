//! DeliveryPipeline: redeems a reference and streams the object exactly once.
//!
//! The catalog's conditional increment is the only gate. Everything after a
//! successful redemption ends in a purge, whether the consumer read every
//! byte, the stream failed or the consumer went away.

use crate::{
    models::object::{ObjectEntry, ObjectId},
    services::{
        catalog::{CatalogError, RedeemOutcome},
        storage_service::StorageService,
    },
};
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{fmt, io};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid download link.")]
    InvalidReference,
    /// Not found, already consumed or expired; deliberately one variant.
    #[error("Link is invalid or expired.")]
    InvalidOrExpired,
    #[error("Error downloading file.")]
    Io(#[source] io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// A redeemed object: its metadata and a body stream that purges it when done.
pub struct Delivery {
    pub entry: ObjectEntry,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").field("entry", &self.entry).finish_non_exhaustive()
    }
}

pub struct DeliveryPipeline {
    store: StorageService,
}

impl DeliveryPipeline {
    pub fn new(store: StorageService) -> Self {
        Self { store }
    }

    /// Redeem `reference` and open the object's byte stream.
    ///
    /// The first chunk is read before returning, so a store that cannot read
    /// the object at all surfaces as `Io` rather than as a broken body.
    pub async fn redeem(&self, reference: &str) -> DeliveryResult<Delivery> {
        let id = ObjectId::parse_reference(reference).map_err(|_| DeliveryError::InvalidReference)?;
        self.store.trigger_sweep();

        let entry = match self.store.catalog.try_redeem(&id, self.store.clock.now()).await? {
            RedeemOutcome::Redeemed(entry) => entry,
            RedeemOutcome::NotFound => {
                info!(%id, cause = "not_found", "redemption rejected");
                return Err(DeliveryError::InvalidOrExpired);
            }
            RedeemOutcome::AlreadyConsumed { stale } => {
                info!(%id, cause = "consumed", stale, "redemption rejected");
                if stale {
                    self.store.purge_best_effort(&id).await;
                }
                return Err(DeliveryError::InvalidOrExpired);
            }
            RedeemOutcome::Expired => {
                info!(%id, cause = "expired", "redemption rejected");
                self.store.purge_best_effort(&id).await;
                return Err(DeliveryError::InvalidOrExpired);
            }
        };
        info!(%id, size_bytes = entry.size_bytes, "object redeemed");

        let mut guard = PurgeOnDrop::new(self.store.clone(), id);
        let mut chunks = self.store.chunks.ordered_stream(&id);
        let pending = match chunks.next().await {
            Some(Ok(first)) => Some(first),
            Some(Err(err)) => {
                warn!(%id, error = %err, "failed to open object for streaming");
                guard.purge_now().await;
                return Err(DeliveryError::Io(err));
            }
            None => None,
        };

        let body = BodyState {
            chunks,
            pending,
            first_polled: false,
            expected: u64::try_from(entry.size_bytes).unwrap_or(0),
            sent: 0,
            guard,
            finished: false,
        };

        Ok(Delivery {
            entry,
            body: futures::stream::unfold(body, BodyState::step).boxed(),
        })
    }
}

struct BodyState {
    chunks: BoxStream<'static, io::Result<Bytes>>,
    /// First chunk, read ahead by `redeem`.
    pending: Option<Bytes>,
    first_polled: bool,
    expected: u64,
    sent: u64,
    guard: PurgeOnDrop,
    finished: bool,
}

impl BodyState {
    async fn step(mut self) -> Option<(io::Result<Bytes>, Self)> {
        if self.finished {
            return None;
        }

        let next = if self.first_polled {
            self.chunks.next().await
        } else {
            self.first_polled = true;
            self.pending.take().map(Ok)
        };

        match next {
            Some(Ok(bytes)) => {
                self.sent += bytes.len() as u64;
                if self.sent > self.expected {
                    let err = io::Error::new(io::ErrorKind::InvalidData, "object larger than recorded size");
                    return Some((Err(self.fail(err).await), self));
                }
                Some((Ok(bytes), self))
            }
            Some(Err(err)) => Some((Err(self.fail(err).await), self)),
            None if self.sent < self.expected => {
                let err = io::Error::new(io::ErrorKind::UnexpectedEof, "object truncated in chunk store");
                Some((Err(self.fail(err).await), self))
            }
            None => {
                debug!(id = %self.guard.id, bytes = self.sent, "object delivered");
                self.guard.purge_now().await;
                None
            }
        }
    }

    async fn fail(&mut self, err: io::Error) -> io::Error {
        warn!(id = %self.guard.id, error = %err, sent = self.sent, "object stream failed");
        self.finished = true;
        self.guard.purge_now().await;
        err
    }
}

/// Purges the object when dropped unless already purged.
struct PurgeOnDrop {
    store: Option<StorageService>,
    id: ObjectId,
}

impl PurgeOnDrop {
    fn new(store: StorageService, id: ObjectId) -> Self {
        Self {
            store: Some(store),
            id,
        }
    }

    async fn purge_now(&mut self) {
        if let Some(store) = self.store.take() {
            store.purge_best_effort(&self.id).await;
        }
    }
}

impl Drop for PurgeOnDrop {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let id = self.id;
        match Handle::try_current() {
            Ok(handle) => {
                debug!(%id, "consumer went away before end of stream, purging");
                handle.spawn(async move { store.purge_best_effort(&id).await });
            }
            Err(_) => warn!(%id, "no runtime to purge abandoned delivery; left for the sweeper"),
        }
    }
}
