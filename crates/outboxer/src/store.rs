//! The claim store contract: the engine's only view of the durable outbox.

use crate::message::{MessageBatch, MessageId};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Durable outbox the relay claims messages from.
///
/// Exclusion between concurrent relays lives entirely in [`claim_batch`]:
/// it must select and mark rows in one atomic operation so that no two
/// claims ever return the same row.
///
/// [`claim_batch`]: ClaimStore::claim_batch
#[async_trait]
pub trait ClaimStore: Send + Sync + 'static {
    /// Atomically select unlocked rows, mark them locked with the current
    /// time, and return their payloads in claim order. Stores may cap the
    /// number of rows per claim; the rest wait for the next one.
    ///
    /// Returns an empty batch when nothing is eligible. An error means the
    /// store could not execute the claim at all.
    async fn claim_batch(&self) -> Result<MessageBatch>;

    /// Permanently remove the given rows. Unknown ids are ignored.
    async fn delete(&self, ids: &[MessageId]) -> Result<()>;

    /// Make the given rows eligible for a later claim. Unknown ids are ignored.
    async fn unlock(&self, ids: &[MessageId]) -> Result<()>;

    /// Unlock rows that have stayed locked for longer than `older_than`.
    ///
    /// Recovers rows claimed by a relay that died before resolving them.
    /// Returns the number of rows unlocked.
    async fn unlock_stale(&self, _older_than: Duration) -> Result<u64> {
        Ok(0)
    }

    /// Release the underlying connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: ClaimStore + ?Sized> ClaimStore for Arc<T> {
    async fn claim_batch(&self) -> Result<MessageBatch> {
        (**self).claim_batch().await
    }

    async fn delete(&self, ids: &[MessageId]) -> Result<()> {
        (**self).delete(ids).await
    }

    async fn unlock(&self, ids: &[MessageId]) -> Result<()> {
        (**self).unlock(ids).await
    }

    async fn unlock_stale(&self, older_than: Duration) -> Result<u64> {
        (**self).unlock_stale(older_than).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
