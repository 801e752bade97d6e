//! Lifecycle group for the relay's stages.

use crate::error::{RelayError, RelayResult};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// Owns the cancellation tokens and task handles of one relay run.
///
/// Two tokens drive shutdown:
/// - `shutdown` stops intake. Stages that produce new work (poll, sweep)
///   watch it; downstream stages keep draining until their input closes.
/// - `abort` stops everything immediately. It is the parent of `shutdown`,
///   so aborting also stops intake.
///
/// The first stage to fail or panic is recorded and triggers `shutdown`.
pub struct Supervisor {
    abort: CancellationToken,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<Mutex<Option<RelayError>>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let abort = CancellationToken::new();
        let shutdown = abort.child_token();
        Self {
            abort,
            shutdown,
            tracker: TaskTracker::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn a named stage onto the current runtime.
    ///
    /// The stage is dropped at its next suspension point once `abort` fires.
    pub fn spawn<F>(&self, stage: &'static str, future: F)
    where
        F: Future<Output = RelayResult<()>> + Send + 'static,
    {
        let abort = self.abort.clone();
        let shutdown = self.shutdown.clone();
        let first_error = self.first_error.clone();

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    error!(stage, "stage aborted before draining");
                    return;
                }
                outcome = AssertUnwindSafe(future).catch_unwind() => outcome,
            };

            let result = outcome.unwrap_or(Err(RelayError::StagePanicked { stage }));
            match result {
                Ok(()) => debug!(stage, "stage stopped"),
                Err(err) => {
                    error!(stage, error = %err, "stage failed, shutting down relay");
                    first_error
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(err);
                    shutdown.cancel();
                }
            }
        });
    }

    /// Token watched by stages that take in new work.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token that stops every stage.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Stop intake; in-flight work keeps draining.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested, by a caller or by a
    /// failing stage.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await
    }

    /// Number of stages still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every spawned stage to finish. No stage may be spawned
    /// afterwards.
    ///
    /// Cancel-safe: if the returned future is dropped the stages keep running
    /// and `wait` can be called again.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// The first fatal stage error, if any.
    pub fn take_error(&self) -> Option<RelayError> {
        self.first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
