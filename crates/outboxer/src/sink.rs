//! The message sink contract: the engine's only view of the broker.

use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Broker destination messages are relayed to.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Deliver one message and wait for the broker to accept it.
    ///
    /// Implementations must not retry internally. Any error, transient or
    /// not, sends the message back to the store to be claimed again.
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Flush pending work and release the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: MessageSink + ?Sized> MessageSink for Arc<T> {
    async fn publish(&self, message: &Message) -> Result<()> {
        (**self).publish(message).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
