//! # Outboxer
//!
//! A transactional-outbox relay: messages written durably to an outbox by
//! some upstream writer are claimed, published to a broker, and resolved
//! against the outbox once the broker's answer is known.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │          ClaimStore          │
//!                 └──────▲───────────────┬───────┘
//!        delete / unlock │               │ claim_batch() every tick
//!                        │               ▼
//!                 ┌──────┴──────┐  ┌───────────┐
//!                 │   resolve   │  │   poll    │
//!                 └──▲───────▲──┘  └─────┬─────┘
//!        success queue│       │failure    │ publish queue
//!                     │       │queue      ▼
//!                 ┌───┴───────┴──────────────────┐
//!                 │           publish            │──► MessageSink
//!                 └──────────────────────────────┘
//! ```
//!
//! Each stage runs as its own task inside a [`Supervisor`]; stages share
//! nothing but the queues between them.
//!
//! ## Key Invariants
//!
//! 1. **Claims are exclusive** - the store selects and locks rows atomically
//! 2. **One attempt per claim** - the sink is called once per dequeued message
//! 3. **Every outcome is resolved** - each published id reaches exactly one of
//!    `delete` (success) or `unlock` (failure)
//! 4. **Drain before release** - shutdown stops intake, lets queued work
//!    finish, and only then closes the adapters
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: a message is deleted only after the sink
//!   accepted it; a crash in between republishes it
//! - **No broker ordering**: claim order is kept up to the sink, not beyond
//! - **Transient failures are retried**: store and sink outages never stop
//!   the relay, the next tick simply tries again
//!
//! ## Example
//!
//! ```ignore
//! use outboxer::{Relay, RelayConfig};
//!
//! let relay = Relay::builder(store, sink)
//!     .config(RelayConfig::default())
//!     .build()?;
//!
//! let handle = relay.start();
//!
//! tokio::signal::ctrl_c().await?;
//! let stats = handle.shutdown().await?;
//! println!("relayed {} messages", stats.deleted);
//! ```

mod config;
mod error;
mod message;
mod periodic;
mod relay;
mod sink;
mod stats;
mod store;
mod supervisor;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult, ResolveAction};
pub use message::{Message, MessageBatch, MessageId};
pub use periodic::run_periodically;
pub use relay::{Relay, RelayBuilder, RelayHandle};
pub use sink::MessageSink;
pub use stats::RelayStatsSnapshot;
pub use store::ClaimStore;
pub use supervisor::Supervisor;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use bytes::Bytes;
