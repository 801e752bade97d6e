//! Test doubles for outboxer relays.
//!
//! - [`InMemoryClaimStore`] - a claim store with real lock semantics,
//!   call recording and failure injection
//! - [`ScriptedSink`] - a sink that succeeds or fails per message id
//!
//! Both are meant to be shared with the relay through an `Arc`, so the test
//! can keep inspecting them while the relay runs:
//!
//! ```ignore
//! let store = Arc::new(InMemoryClaimStore::new());
//! let sink = Arc::new(ScriptedSink::new());
//! let handle = Relay::builder(store.clone(), sink.clone()).build()?.start();
//! ```

mod sink;
mod store;

pub use sink::ScriptedSink;
pub use store::{InMemoryClaimStore, StoredRow};

use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
