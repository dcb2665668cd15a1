//! Retention and one-time-access policy.
//!
//! State is derived from the catalog counters and the clock, never stored.

use crate::models::object::ObjectEntry;
use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Default retention window `T`.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(20 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    Alive,
    Expired,
    Consumed,
    Deleted,
}

impl ObjectState {
    pub fn is_alive(self) -> bool {
        matches!(self, ObjectState::Alive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectState::Alive => "alive",
            ObjectState::Expired => "expired",
            ObjectState::Consumed => "consumed",
            ObjectState::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LifecyclePolicy {
    retention: TimeDelta,
}

impl LifecyclePolicy {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn retention(&self) -> TimeDelta {
        self.retention
    }

    /// Classify an entry at `now`. `None` means the entry is already gone.
    ///
    /// Consumption wins over expiry; an entry is expired only once strictly
    /// more than `T` has passed since `created_at`.
    pub fn state(&self, entry: Option<&ObjectEntry>, now: DateTime<Utc>) -> ObjectState {
        match entry {
            None => ObjectState::Deleted,
            Some(entry) if entry.redemption_count >= 1 => ObjectState::Consumed,
            Some(entry) if now - entry.created_at > self.retention => ObjectState::Expired,
            Some(_) => ObjectState::Alive,
        }
    }

    /// Oldest `created_at` still redeemable at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Instant after which an unredeemed entry is expired.
    pub fn expires_at(&self, entry: &ObjectEntry) -> DateTime<Utc> {
        entry
            .created_at
            .checked_add_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
