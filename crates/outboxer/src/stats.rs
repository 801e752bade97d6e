//! Relay counters, shared by the stages and read through snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the stages of one relay.
#[derive(Debug, Default)]
pub(crate) struct RelayStats {
    claimed: AtomicU64,
    published: AtomicU64,
    publish_failed: AtomicU64,
    deleted: AtomicU64,
    unlocked: AtomicU64,
    resolve_failures: AtomicU64,
    poll_failures: AtomicU64,
    swept: AtomicU64,
    abandoned: AtomicU64,
}

impl RelayStats {
    pub(crate) fn record_claimed(&self, n: usize) {
        self.claimed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self, n: usize) {
        self.deleted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_unlocked(&self, n: usize) {
        self.unlocked.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_swept(&self, n: u64) {
        self.swept.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self, n: usize) {
        self.abandoned.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            unlocked: self.unlocked.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a relay's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    /// Messages returned by successful claims.
    pub claimed: u64,
    pub published: u64,
    pub publish_failed: u64,
    /// Ids passed to a delete call that succeeded.
    pub deleted: u64,
    /// Ids passed to an unlock call that succeeded.
    pub unlocked: u64,
    /// Failed delete or unlock calls.
    pub resolve_failures: u64,
    /// Claims that failed with the store unavailable.
    pub poll_failures: u64,
    /// Rows returned to the pool by the stale-lock sweep.
    pub swept: u64,
    /// Ids whose resolution was given up on, after the final drain ran out
    /// of attempts or the resolve stage was aborted. Their rows stay locked.
    pub abandoned: u64,
}

impl RelayStatsSnapshot {
    /// Messages handed to the publish stage but not yet resolved either way.
    pub fn in_flight(&self) -> u64 {
        self.claimed
            .saturating_sub(self.deleted)
            .saturating_sub(self.unlocked)
    }
}
