//! ReclamationSweeper: periodic purge of objects past their deadline and of
//! chunk groups that never made it into the catalog.

use crate::services::{
    catalog::CatalogError, lifecycle::ObjectState, storage_service::StorageService,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Counters for one sweep cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Catalog entries older than the cutoff.
    pub scanned: usize,
    /// Expired or consumed entries purged.
    pub reclaimed: usize,
    /// Chunk groups without a catalog entry removed.
    pub orphans_reclaimed: usize,
    /// Per-object cleanups that failed and were skipped.
    pub failures: usize,
}

pub struct ReclamationSweeper {
    store: StorageService,
    interval: Duration,
}

impl ReclamationSweeper {
    pub fn new(store: StorageService, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run one cycle.
    ///
    /// Each listed id is re-classified before deletion, so an entry that
    /// changed after listing is judged on its current state. Per-object
    /// failures are counted and logged; only failing to list the catalog
    /// aborts the cycle.
    pub async fn sweep_once(&self) -> Result<SweepReport, SweepError> {
        let now = self.store.clock.now();
        let cutoff = self.store.policy.cutoff(now);
        let mut report = SweepReport::default();

        let candidates = self.store.catalog.list_older_than(cutoff).await?;
        report.scanned = candidates.len();

        for id in candidates {
            let entry = match self.store.catalog.get(&id).await {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%id, error = %err, "sweep could not re-read entry");
                    report.failures += 1;
                    continue;
                }
            };
            let state = self.store.policy.state(entry.as_ref(), now);
            if matches!(state, ObjectState::Alive | ObjectState::Deleted) {
                continue;
            }
            match self.store.purge(&id).await {
                Ok(()) => {
                    debug!(%id, state = state.as_str(), "swept object");
                    report.reclaimed += 1;
                }
                Err(err) => {
                    warn!(%id, error = %err, "sweep failed to purge object");
                    report.failures += 1;
                }
            }
        }

        self.sweep_orphans(cutoff, &mut report).await;

        if report.reclaimed > 0 || report.orphans_reclaimed > 0 || report.failures > 0 {
            info!(
                scanned = report.scanned,
                reclaimed = report.reclaimed,
                orphans = report.orphans_reclaimed,
                failures = report.failures,
                "sweep finished"
            );
        } else {
            debug!(scanned = report.scanned, "sweep finished, nothing to reclaim");
        }
        Ok(report)
    }

    /// Chunk groups untouched since before `cutoff` with no catalog entry.
    ///
    /// An ingest still writing touches its group with every chunk, so only
    /// abandoned ingests and leftovers of failed purges qualify.
    async fn sweep_orphans(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) {
        let groups = match self.store.chunks.list_groups().await {
            Ok(groups) => groups,
            Err(err) => {
                warn!(error = %err, "sweep could not list chunk groups");
                report.failures += 1;
                return;
            }
        };

        for group in groups.into_iter().filter(|g| g.modified_at < cutoff) {
            match self.store.catalog.get(&group.id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    warn!(id = %group.id, error = %err, "sweep could not check chunk group owner");
                    report.failures += 1;
                    continue;
                }
            }
            match self.store.chunks.delete_all(&group.id).await {
                Ok(()) => {
                    debug!(id = %group.id, "removed orphaned chunk group");
                    report.orphans_reclaimed += 1;
                }
                Err(err) => {
                    warn!(id = %group.id, error = %err, "failed to remove orphaned chunk group");
                    report.failures += 1;
                }
            }
        }
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            warn!(error = %err, "sweep failed");
                        }
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }
}
