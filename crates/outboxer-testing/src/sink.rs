use anyhow::{anyhow, Result};
use async_trait::async_trait;
use outboxer::{Message, MessageId, MessageSink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Always,
    Times(u32),
}

#[derive(Default)]
struct SinkState {
    delivered: Vec<Message>,
    attempts: HashMap<MessageId, u32>,
    total_attempts: usize,
    failures: HashMap<MessageId, Failure>,
    fail_everything: bool,
}

/// Sink that records deliveries and fails on demand.
#[derive(Default)]
pub struct ScriptedSink {
    state: Mutex<SinkState>,
    attempted: Notify,
    delay: Option<Duration>,
    closed: AtomicBool,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every publish, to simulate a slow broker.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reject every publish of `id` until [`succeed`](Self::succeed) is called.
    pub fn fail_always(&self, id: impl Into<MessageId>) {
        self.state().failures.insert(id.into(), Failure::Always);
    }

    /// Reject the next `times` publishes of `id`.
    pub fn fail_times(&self, id: impl Into<MessageId>, times: u32) {
        self.state().failures.insert(id.into(), Failure::Times(times));
    }

    pub fn succeed(&self, id: &MessageId) {
        self.state().failures.remove(id);
    }

    /// Reject every publish, as if the broker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().fail_everything = unavailable;
    }

    /// Messages accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<Message> {
        self.state().delivered.clone()
    }

    pub fn delivered_ids(&self) -> Vec<MessageId> {
        self.state().delivered.iter().map(|m| m.id.clone()).collect()
    }

    /// Publish attempts for `id`, successful or not.
    pub fn attempts(&self, id: &MessageId) -> u32 {
        self.state().attempts.get(id).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.state().total_attempts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` publish attempts have been made.
    pub async fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let attempted = self.attempted.notified();
                if self.total_attempts() >= count {
                    return;
                }
                attempted.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl MessageSink for ScriptedSink {
    async fn publish(&self, message: &Message) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut state = self.state();
            state.total_attempts += 1;
            *state.attempts.entry(message.id.clone()).or_default() += 1;

            let rejected = state.fail_everything
                || match state.failures.get_mut(&message.id) {
                    Some(Failure::Always) => true,
                    Some(Failure::Times(left)) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                };

            if rejected {
                Err(anyhow!("scripted sink rejected message {}", message.id))
            } else {
                state.delivered.push(message.clone());
                Ok(())
            }
        };

        self.attempted.notify_waiters();
        outcome
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
