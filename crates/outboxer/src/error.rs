//! Relay error taxonomy.

use crate::message::MessageId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which resolution a failed store call was attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveAction {
    Delete,
    Unlock,
}

impl fmt::Display for ResolveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveAction::Delete => f.write_str("delete"),
            ResolveAction::Unlock => f.write_str("unlock"),
        }
    }
}

/// Errors produced by the relay engine.
///
/// Store, publish and resolve failures are handled inside the stage that
/// raised them and only show up in logs. The remaining variants surface from
/// [`RelayBuilder::build`](crate::RelayBuilder::build) or
/// [`RelayHandle::shutdown`](crate::RelayHandle::shutdown).
#[derive(Debug, Error)]
pub enum RelayError {
    /// The claim store could not run a claim. Scoped to one poll cycle.
    #[error("claim store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),

    /// The sink rejected a message. Routine; the message is unlocked.
    #[error("failed to publish message {id}")]
    PublishFailure {
        id: MessageId,
        #[source]
        source: anyhow::Error,
    },

    /// A delete or unlock call failed. The ids stay buffered for retry.
    #[error("failed to {action} {count} message(s)")]
    ResolveFailure {
        action: ResolveAction,
        count: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A stage tried to hand work to a queue whose consumer is gone.
    #[error("{stage} stage lost its downstream queue")]
    QueueClosed { stage: &'static str },

    #[error("{stage} stage panicked")]
    StagePanicked { stage: &'static str },

    #[error("relay did not drain within {0:?}")]
    ShutdownTimedOut(Duration),

    #[error("failed to close {resource}")]
    Close {
        resource: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_failure_names_action_and_count() {
        let err = RelayError::ResolveFailure {
            action: ResolveAction::Unlock,
            count: 3,
            source: anyhow::anyhow!("connection reset"),
        };
        assert_eq!(err.to_string(), "failed to unlock 3 message(s)");
        assert_eq!(
            std::error::Error::source(&err).map(|s| s.to_string()),
            Some("connection reset".to_string())
        );
    }
}
