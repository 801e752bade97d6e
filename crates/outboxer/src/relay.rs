//! The claim / publish / resolve pipeline.

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult, ResolveAction};
use crate::message::{Message, MessageId};
use crate::periodic::run_periodically;
use crate::sink::MessageSink;
use crate::stats::{RelayStats, RelayStatsSnapshot};
use crate::store::ClaimStore;
use crate::supervisor::Supervisor;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const POLL_STAGE: &str = "poll";
const PUBLISH_STAGE: &str = "publish";
const RESOLVE_STAGE: &str = "resolve";
const SWEEP_STAGE: &str = "sweep";

/// Builder for [`Relay`].
pub struct RelayBuilder {
    store: Arc<dyn ClaimStore>,
    sink: Arc<dyn MessageSink>,
    config: RelayConfig,
}

impl RelayBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn resolve_batch_size(mut self, size: usize) -> Self {
        self.config.resolve_batch_size = size;
        self
    }

    pub fn resolve_flush_interval(mut self, interval: Duration) -> Self {
        self.config.resolve_flush_interval = interval;
        self
    }

    pub fn resolve_retry_limit(mut self, limit: u32) -> Self {
        self.config.resolve_retry_limit = limit;
        self
    }

    /// Enable the stale-lock sweep.
    pub fn stale_lock_after(mut self, threshold: Duration) -> Self {
        self.config.stale_lock_after = Some(threshold);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> RelayResult<Relay> {
        self.config.validate()?;
        Ok(Relay {
            store: self.store,
            sink: self.sink,
            config: self.config,
        })
    }
}

/// Moves messages from a [`ClaimStore`] to a [`MessageSink`].
///
/// ```text
/// ClaimStore ─claim─► poll ─► publish queue ─► publish ─┬─► success queue ─┐
///     ▲                                                 └─► failure queue ─┤
///     └──────────────────── delete / unlock ◄──────── resolve ◄────────────┘
/// ```
///
/// Each adapter is used by a single stage, so the engine holds no locks of
/// its own; exclusion between relays is the store's atomic claim.
pub struct Relay {
    store: Arc<dyn ClaimStore>,
    sink: Arc<dyn MessageSink>,
    config: RelayConfig,
}

impl Relay {
    pub fn builder(store: impl ClaimStore, sink: impl MessageSink) -> RelayBuilder {
        RelayBuilder {
            store: Arc::new(store),
            sink: Arc::new(sink),
            config: RelayConfig::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Spawn every stage onto the current tokio runtime.
    pub fn start(self) -> RelayHandle {
        let Relay {
            store,
            sink,
            config,
        } = self;

        let supervisor = Arc::new(Supervisor::new());
        let stats = Arc::new(RelayStats::default());

        let (publish_tx, publish_rx) = mpsc::channel(config.queue_capacity);
        let (success_tx, success_rx) = mpsc::channel(config.queue_capacity);
        let (failure_tx, failure_rx) = mpsc::channel(config.queue_capacity);

        spawn_resolve_stage(
            &supervisor,
            store.clone(),
            success_rx,
            failure_rx,
            &config,
            stats.clone(),
        );
        spawn_publish_stage(
            &supervisor,
            sink.clone(),
            publish_rx,
            Outcomes {
                success: success_tx,
                failure: failure_tx,
            },
            config.poll_interval,
            stats.clone(),
        );
        spawn_poll_stage(
            &supervisor,
            store.clone(),
            publish_tx,
            config.poll_interval,
            stats.clone(),
        );
        if let Some(threshold) = config.stale_lock_after {
            spawn_sweep_stage(
                &supervisor,
                store.clone(),
                threshold,
                config.poll_interval,
                stats.clone(),
            );
        }

        info!(
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            queue_capacity = config.queue_capacity,
            stale_lock_sweep = config.stale_lock_after.is_some(),
            "relay started"
        );

        RelayHandle {
            supervisor,
            store,
            sink,
            stats,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Control surface of a running relay.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) aborts
/// every stage without draining and leaves the adapters open.
pub struct RelayHandle {
    supervisor: Arc<Supervisor>,
    store: Arc<dyn ClaimStore>,
    sink: Arc<dyn MessageSink>,
    stats: Arc<RelayStats>,
    shutdown_timeout: Duration,
}

impl RelayHandle {
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether any stage is still running.
    pub fn is_running(&self) -> bool {
        self.supervisor.running() > 0
    }

    /// Resolves when shutdown has been triggered, including by a stage that
    /// failed fatally.
    pub async fn stopped(&self) {
        self.supervisor.shutdown_requested().await
    }

    /// Stop the relay gracefully.
    ///
    /// 1. The poll and sweep stages stop taking ticks; a claim in progress
    ///    finishes and its messages are handed off.
    /// 2. Every claimed message is published and resolved. Queues close in
    ///    pipeline order as each stage's producer exits.
    /// 3. The store, then the sink, are closed.
    ///
    /// If draining exceeds the configured timeout the stages are aborted and
    /// `ShutdownTimedOut` is returned; adapters are still closed. A fatal
    /// stage error recorded during the run takes precedence.
    pub async fn shutdown(self) -> RelayResult<RelayStatsSnapshot> {
        info!("shutting down relay");
        self.supervisor.shutdown();

        let drained = tokio::time::timeout(self.shutdown_timeout, self.supervisor.wait())
            .await
            .is_ok();
        if !drained {
            error!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                in_flight = self.stats.snapshot().in_flight(),
                "relay did not drain in time, aborting stages"
            );
            self.supervisor.abort();
            self.supervisor.wait().await;
            error!(
                abandoned = self.stats.snapshot().abandoned,
                "relay aborted; buffered resolutions were lost"
            );
        }

        let mut outcome = match self.supervisor.take_error() {
            Some(err) => Err(err),
            None if !drained => Err(RelayError::ShutdownTimedOut(self.shutdown_timeout)),
            None => Ok(()),
        };

        if let Err(source) = self.store.close().await {
            error!(error = %format!("{source:#}"), "failed to close claim store");
            if outcome.is_ok() {
                outcome = Err(RelayError::Close {
                    resource: "claim store",
                    source,
                });
            }
        }
        if let Err(source) = self.sink.close().await {
            error!(error = %format!("{source:#}"), "failed to close message sink");
            if outcome.is_ok() {
                outcome = Err(RelayError::Close {
                    resource: "message sink",
                    source,
                });
            }
        }

        let stats = self.stats.snapshot();
        info!(
            claimed = stats.claimed,
            published = stats.published,
            publish_failed = stats.publish_failed,
            deleted = stats.deleted,
            unlocked = stats.unlocked,
            abandoned = stats.abandoned,
            "relay stopped"
        );
        outcome.map(|()| stats)
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

fn describe(err: RelayError) -> String {
    format!("{:#}", anyhow::Error::from(err))
}

// ============================================================================
// Poll stage
// ============================================================================

fn spawn_poll_stage(
    supervisor: &Supervisor,
    store: Arc<dyn ClaimStore>,
    publish_tx: mpsc::Sender<Message>,
    period: Duration,
    stats: Arc<RelayStats>,
) {
    // The sender lives in this closure; it is dropped, closing the publish
    // queue, when the periodic loop ends.
    run_periodically(
        supervisor,
        POLL_STAGE,
        period,
        supervisor.shutdown_token(),
        move || {
            let store = store.clone();
            let publish_tx = publish_tx.clone();
            let stats = stats.clone();
            async move { poll_once(store.as_ref(), &publish_tx, &stats).await }
        },
    );
}

async fn poll_once(
    store: &dyn ClaimStore,
    publish_tx: &mpsc::Sender<Message>,
    stats: &RelayStats,
) -> RelayResult<ControlFlow<()>> {
    let batch = match store.claim_batch().await {
        Ok(batch) => batch,
        Err(source) => {
            stats.record_poll_failure();
            warn!(
                error = %describe(RelayError::StoreUnavailable(source)),
                "claim failed, retrying on next tick"
            );
            return Ok(ControlFlow::Continue(()));
        }
    };

    if batch.is_empty() {
        trace!("nothing to claim");
        return Ok(ControlFlow::Continue(()));
    }

    stats.record_claimed(batch.len());
    debug!(count = batch.len(), "claimed batch");

    let mut batch = batch.into_iter();
    while let Some(message) = batch.next() {
        if publish_tx.send(message).await.is_err() {
            error!(
                stranded = batch.len() + 1,
                "publish queue closed with claimed messages still pending"
            );
            return Err(RelayError::QueueClosed { stage: POLL_STAGE });
        }
    }

    Ok(ControlFlow::Continue(()))
}

// ============================================================================
// Publish stage
// ============================================================================

#[derive(Clone)]
struct Outcomes {
    success: mpsc::Sender<MessageId>,
    failure: mpsc::Sender<MessageId>,
}

fn spawn_publish_stage(
    supervisor: &Supervisor,
    sink: Arc<dyn MessageSink>,
    publish_rx: mpsc::Receiver<Message>,
    outcomes: Outcomes,
    period: Duration,
    stats: Arc<RelayStats>,
) {
    // A tick consumes the queue until it closes, so in practice the body
    // runs once; the lock only lets the tick's future own the receiver.
    let publish_rx = Arc::new(Mutex::new(publish_rx));

    run_periodically(
        supervisor,
        PUBLISH_STAGE,
        period,
        supervisor.abort_token(),
        move || {
            let sink = sink.clone();
            let publish_rx = publish_rx.clone();
            let outcomes = outcomes.clone();
            let stats = stats.clone();
            async move {
                let mut publish_rx = publish_rx.lock().await;
                publish_pending(sink.as_ref(), &mut *publish_rx, &outcomes, &stats).await
            }
        },
    );
}

/// Publish every message until the publish queue is closed and empty.
///
/// Blocks without spinning while the queue is empty. Returns `Break` once
/// the poll stage has gone and nothing is left, which drops this stage's
/// outcome senders and lets the resolve stage finish.
async fn publish_pending(
    sink: &dyn MessageSink,
    publish_rx: &mut mpsc::Receiver<Message>,
    outcomes: &Outcomes,
    stats: &RelayStats,
) -> RelayResult<ControlFlow<()>> {
    while let Some(message) = publish_rx.recv().await {
        publish_one(sink, message, outcomes, stats).await?;
    }

    debug!("publish queue closed and drained");
    Ok(ControlFlow::Break(()))
}

async fn publish_one(
    sink: &dyn MessageSink,
    message: Message,
    outcomes: &Outcomes,
    stats: &RelayStats,
) -> RelayResult<()> {
    let queue = match sink.publish(&message).await {
        Ok(()) => {
            stats.record_published();
            trace!(message_id = %message.id, "published");
            &outcomes.success
        }
        Err(source) => {
            stats.record_publish_failed();
            debug!(
                message_id = %message.id,
                error = %describe(RelayError::PublishFailure {
                    id: message.id.clone(),
                    source,
                }),
                "publish failed, message will be unlocked"
            );
            &outcomes.failure
        }
    };

    queue
        .send(message.id)
        .await
        .map_err(|_| RelayError::QueueClosed {
            stage: PUBLISH_STAGE,
        })
}

// ============================================================================
// Resolve stage
// ============================================================================

/// Ids waiting for one kind of resolution.
///
/// Ids still buffered when this is dropped, because the drain ran out of
/// attempts or the resolve stage was aborted, are logged at error and
/// counted as abandoned.
struct PendingResolution {
    action: ResolveAction,
    ids: Vec<MessageId>,
    /// Set after a failed flush. Size-triggered flushes are skipped until
    /// a timer pass succeeds.
    failing: bool,
    stats: Arc<RelayStats>,
}

impl PendingResolution {
    fn new(action: ResolveAction, stats: Arc<RelayStats>) -> Self {
        Self {
            action,
            ids: Vec::new(),
            failing: false,
            stats,
        }
    }

    fn push(&mut self, id: MessageId) {
        self.ids.push(id);
    }

    fn should_flush(&self, batch_size: usize) -> bool {
        !self.failing && self.ids.len() >= batch_size
    }

    /// Hand the buffered ids to the store. On failure they stay buffered.
    async fn flush(&mut self, store: &dyn ClaimStore) -> bool {
        if self.ids.is_empty() {
            return true;
        }

        let count = self.ids.len();
        let result = match self.action {
            ResolveAction::Delete => store.delete(&self.ids).await,
            ResolveAction::Unlock => store.unlock(&self.ids).await,
        };

        match result {
            Ok(()) => {
                match self.action {
                    ResolveAction::Delete => self.stats.record_deleted(count),
                    ResolveAction::Unlock => self.stats.record_unlocked(count),
                }
                debug!(action = %self.action, count, "resolved messages");
                self.ids.clear();
                self.failing = false;
                true
            }
            Err(source) => {
                self.stats.record_resolve_failure();
                error!(
                    action = %self.action,
                    count,
                    error = %describe(RelayError::ResolveFailure {
                        action: self.action,
                        count,
                        source,
                    }),
                    "resolve failed, will retry"
                );
                self.failing = true;
                false
            }
        }
    }

    /// Final flush with a bounded number of attempts.
    async fn drain(&mut self, store: &dyn ClaimStore, attempts: u32, backoff: Duration) {
        for attempt in 1..=attempts {
            if self.flush(store).await {
                return;
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
            }
        }

        self.abandon(&format!("store still failing after {attempts} attempts"));
    }

    fn abandon(&mut self, reason: &str) {
        if self.ids.is_empty() {
            return;
        }

        let ids: Vec<&str> = self.ids.iter().map(MessageId::as_str).collect();
        error!(
            action = %self.action,
            count = ids.len(),
            ids = ?ids,
            reason,
            "giving up on resolving messages; their rows stay locked until swept or unlocked manually"
        );
        self.stats.record_abandoned(self.ids.len());
        self.ids.clear();
    }
}

impl Drop for PendingResolution {
    fn drop(&mut self) {
        self.abandon("resolve stage stopped before draining");
    }
}

fn spawn_resolve_stage(
    supervisor: &Supervisor,
    store: Arc<dyn ClaimStore>,
    success_rx: mpsc::Receiver<MessageId>,
    failure_rx: mpsc::Receiver<MessageId>,
    config: &RelayConfig,
    stats: Arc<RelayStats>,
) {
    let batch_size = config.resolve_batch_size;
    let flush_interval = config.resolve_flush_interval;
    let retry_limit = config.resolve_retry_limit;

    supervisor.spawn(RESOLVE_STAGE, async move {
        resolve_loop(
            store.as_ref(),
            success_rx,
            failure_rx,
            batch_size,
            flush_interval,
            retry_limit,
            stats,
        )
        .await;
        Ok(())
    });
}

/// Consume both outcome queues until they close, resolving as we go.
async fn resolve_loop(
    store: &dyn ClaimStore,
    mut success_rx: mpsc::Receiver<MessageId>,
    mut failure_rx: mpsc::Receiver<MessageId>,
    batch_size: usize,
    flush_interval: Duration,
    retry_limit: u32,
    stats: Arc<RelayStats>,
) {
    let mut deletes = PendingResolution::new(ResolveAction::Delete, stats.clone());
    let mut unlocks = PendingResolution::new(ResolveAction::Unlock, stats);

    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut success_open = true;
    let mut failure_open = true;

    while success_open || failure_open {
        tokio::select! {
            id = success_rx.recv(), if success_open => match id {
                Some(id) => {
                    deletes.push(id);
                    if deletes.should_flush(batch_size) {
                        deletes.flush(store).await;
                    }
                }
                None => success_open = false,
            },
            id = failure_rx.recv(), if failure_open => match id {
                Some(id) => {
                    unlocks.push(id);
                    if unlocks.should_flush(batch_size) {
                        unlocks.flush(store).await;
                    }
                }
                None => failure_open = false,
            },
            _ = ticker.tick() => {
                deletes.flush(store).await;
                unlocks.flush(store).await;
            }
        }
    }

    debug!("outcome queues closed, flushing remaining resolutions");
    deletes.drain(store, retry_limit, flush_interval).await;
    unlocks.drain(store, retry_limit, flush_interval).await;
}

// ============================================================================
// Sweep stage
// ============================================================================

fn spawn_sweep_stage(
    supervisor: &Supervisor,
    store: Arc<dyn ClaimStore>,
    threshold: Duration,
    period: Duration,
    stats: Arc<RelayStats>,
) {
    run_periodically(
        supervisor,
        SWEEP_STAGE,
        period,
        supervisor.shutdown_token(),
        move || {
            let store = store.clone();
            let stats = stats.clone();
            async move {
                match store.unlock_stale(threshold).await {
                    Ok(0) => {}
                    Ok(count) => {
                        stats.record_swept(count);
                        info!(count, "unlocked stale rows");
                    }
                    Err(source) => {
                        warn!(error = %format!("{source:#}"), "stale lock sweep failed");
                    }
                }
                Ok(ControlFlow::Continue(()))
            }
        },
    );
}
