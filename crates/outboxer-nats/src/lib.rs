//! NATS JetStream sink for the outboxer relay.
//!
//! Every message is published to one subject and acknowledged by JetStream
//! before the relay counts it as delivered. The message id travels in the
//! `Nats-Msg-Id` header, so a message republished after a crash inside the
//! stream's duplicate window is dropped by the server.
//!
//! # Usage
//!
//! ```rust,ignore
//! use outboxer_nats::NatsSink;
//!
//! let sink = NatsSink::connect("nats://localhost:4222", "outbox.events", timeout).await?;
//! sink.ensure_stream("OUTBOX").await?;
//!
//! let relay = Relay::builder(store, sink).build()?;
//! ```

use anyhow::{Context, Result};
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use outboxer::{Message, MessageSink};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// Connection settings for [`NatsSink::connect_with`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSinkConfig {
    pub url: String,
    pub subject: String,
    /// Stream to create over `subject` if it does not exist yet.
    pub stream: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for NatsSinkConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject: "outbox".to_string(),
            stream: None,
            connect_timeout_ms: 5_000,
        }
    }
}

pub struct NatsSink {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    subject: String,
}

impl NatsSink {
    pub async fn connect(url: &str, subject: impl Into<String>, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .context("failed to connect to NATS")?;

        let jetstream = jetstream::new(client.clone());

        info!("connected to NATS");
        Ok(Self {
            client,
            jetstream,
            subject: subject.into(),
        })
    }

    /// Connect and, when the config names a stream, make sure it exists.
    pub async fn connect_with(config: &NatsSinkConfig) -> Result<Self> {
        let sink = Self::connect(
            &config.url,
            config.subject.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )
        .await?;

        if let Some(stream) = &config.stream {
            sink.ensure_stream(stream).await?;
        }
        Ok(sink)
    }

    /// Create a stream capturing this sink's subject unless one named
    /// `stream_name` already exists.
    pub async fn ensure_stream(&self, stream_name: &str) -> Result<()> {
        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                info!(stream = %stream_name, "stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(stream_config(stream_name, &self.subject))
                    .await
                    .with_context(|| format!("failed to create stream {stream_name}"))?;
                info!(stream = %stream_name, subject = %self.subject, "created stream");
            }
        }
        Ok(())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

fn stream_config(name: &str, subject: &str) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        subjects: vec![subject.to_string()],
        description: Some("Messages relayed from the transactional outbox".to_string()),
        ..Default::default()
    }
}

fn message_headers(message: &Message) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(NATS_MESSAGE_ID, message.id.as_str());
    headers
}

#[async_trait]
impl MessageSink for NatsSink {
    async fn publish(&self, message: &Message) -> Result<()> {
        let ack = self
            .jetstream
            .publish_with_headers(
                self.subject.clone(),
                message_headers(message),
                message.body.clone(),
            )
            .await
            .with_context(|| format!("failed to publish message {}", message.id))?;

        let ack = ack
            .await
            .with_context(|| format!("no JetStream acknowledgement for message {}", message.id))?;

        debug!(
            message_id = %message.id,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "message acknowledged"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("flushing NATS connection");
        self.client
            .flush()
            .await
            .context("failed to flush NATS connection")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_becomes_the_dedup_header() {
        let message = Message::new("0b7c5a8e-order-42", "payload");
        let headers = message_headers(&message);

        let value = headers.get(NATS_MESSAGE_ID).map(|v| v.as_str().to_string());
        assert_eq!(value.as_deref(), Some("0b7c5a8e-order-42"));
    }

    #[test]
    fn stream_captures_only_the_sink_subject() {
        let config = stream_config("OUTBOX", "outbox.events");
        assert_eq!(config.name, "OUTBOX");
        assert_eq!(config.subjects, vec!["outbox.events".to_string()]);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = NatsSinkConfig::default();
        assert_eq!(config.subject, "outbox");
        assert!(config.stream.is_none());
        assert_eq!(config.connect_timeout_ms, 5_000);
    }
}
