use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use outboxer::{ClaimStore, Message, MessageBatch, MessageId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// One outbox row as the in-memory store keeps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub id: MessageId,
    pub payload: Bytes,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
}

/// Claim store backed by a `Vec` under a single mutex.
///
/// The mutex makes every claim atomic, which is exactly the guarantee a
/// real store provides with a transaction.
#[derive(Default)]
pub struct InMemoryClaimStore {
    rows: Mutex<Vec<StoredRow>>,
    delete_calls: Mutex<Vec<Vec<MessageId>>>,
    unlock_calls: Mutex<Vec<Vec<MessageId>>>,
    claim_calls: AtomicUsize,
    failing_claims: AtomicU32,
    failing_deletes: AtomicU32,
    failing_unlocks: AtomicU32,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrement `counter` if positive. Returns whether a failure was consumed.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unlocked row with a generated id.
    pub fn insert(&self, payload: impl Into<Bytes>) -> MessageId {
        let id = MessageId::from(Uuid::new_v4());
        self.insert_with_id(id.clone(), payload);
        id
    }

    /// Insert an unlocked row with a caller-chosen id.
    pub fn insert_with_id(&self, id: impl Into<MessageId>, payload: impl Into<Bytes>) {
        lock(&self.rows).push(StoredRow {
            id: id.into(),
            payload: payload.into(),
            locked: false,
            locked_at: None,
        });
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        lock(&self.rows).clone()
    }

    pub fn row_count(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        lock(&self.rows).iter().any(|row| &row.id == id)
    }

    pub fn is_locked(&self, id: &MessageId) -> Option<bool> {
        lock(&self.rows)
            .iter()
            .find(|row| &row.id == id)
            .map(|row| row.locked)
    }

    pub fn locked_count(&self) -> usize {
        lock(&self.rows).iter().filter(|row| row.locked).count()
    }

    /// Lock every row, as if another relay had claimed them.
    pub fn lock_all(&self) {
        let now = Utc::now();
        for row in lock(&self.rows).iter_mut() {
            row.locked = true;
            row.locked_at = Some(now);
        }
    }

    /// Move the lock timestamp of every locked row `by` into the past.
    pub fn age_locks(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        for row in lock(&self.rows).iter_mut() {
            if let Some(at) = row.locked_at {
                row.locked_at = Some(at - by);
            }
        }
    }

    /// Ids passed to each `delete` call, in call order.
    pub fn delete_calls(&self) -> Vec<Vec<MessageId>> {
        lock(&self.delete_calls).clone()
    }

    /// Ids passed to each `unlock` call, in call order.
    pub fn unlock_calls(&self) -> Vec<Vec<MessageId>> {
        lock(&self.unlock_calls).clone()
    }

    pub fn deleted_ids(&self) -> Vec<MessageId> {
        self.delete_calls().into_iter().flatten().collect()
    }

    pub fn unlocked_ids(&self) -> Vec<MessageId> {
        self.unlock_calls().into_iter().flatten().collect()
    }

    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_claims(&self, n: u32) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, n: u32) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_unlocks(&self, n: u32) {
        self.failing_unlocks.store(n, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn claim_batch(&self) -> Result<MessageBatch> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_claims) {
            return Err(anyhow!("in-memory store: injected claim failure"));
        }

        let now = Utc::now();
        let mut rows = lock(&self.rows);
        Ok(rows
            .iter_mut()
            .filter(|row| !row.locked)
            .map(|row| {
                row.locked = true;
                row.locked_at = Some(now);
                Message::new(row.id.clone(), row.payload.clone())
            })
            .collect())
    }

    async fn delete(&self, ids: &[MessageId]) -> Result<()> {
        if take_failure(&self.failing_deletes) {
            return Err(anyhow!("in-memory store: injected delete failure"));
        }
        lock(&self.delete_calls).push(ids.to_vec());
        lock(&self.rows).retain(|row| !ids.contains(&row.id));
        Ok(())
    }

    async fn unlock(&self, ids: &[MessageId]) -> Result<()> {
        if take_failure(&self.failing_unlocks) {
            return Err(anyhow!("in-memory store: injected unlock failure"));
        }
        lock(&self.unlock_calls).push(ids.to_vec());
        for row in lock(&self.rows).iter_mut() {
            if ids.contains(&row.id) {
                row.locked = false;
                row.locked_at = None;
            }
        }
        Ok(())
    }

    async fn unlock_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than)?;
        let mut unlocked = 0;
        for row in lock(&self.rows).iter_mut() {
            if row.locked && row.locked_at.is_some_and(|at| at < cutoff) {
                row.locked = false;
                row.locked_at = None;
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
