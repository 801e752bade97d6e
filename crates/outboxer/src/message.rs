//! The unit of relay.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier assigned to a message by the claim store.
///
/// The relay never interprets it; it is only handed back to the store to
/// address `delete` and `unlock`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A claimed outbox message.
///
/// The body is opaque to the relay: it is never parsed, only forwarded to
/// the sink. Cloning is cheap since the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, body: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }
}

/// Messages returned by a single claim. Order carries no meaning.
pub type MessageBatch = Vec<Message>;
