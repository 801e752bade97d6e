//! Fixed-interval execution of a unit of work inside a supervised stage.

use crate::error::RelayResult;
use crate::supervisor::Supervisor;
use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `work` every `period` as the stage `stage` of `supervisor`.
///
/// The first invocation happens immediately. Invocations never overlap: the
/// next tick is awaited only after `work` completes, and ticks missed while
/// it ran collapse into a single immediate tick.
///
/// `stop` is only observed between invocations, so a started cycle always
/// runs to completion. The loop also ends when `work` returns
/// `ControlFlow::Break` or an error; the error is reported to the supervisor.
pub fn run_periodically<F, Fut>(
    supervisor: &Supervisor,
    stage: &'static str,
    period: Duration,
    stop: CancellationToken,
    mut work: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = RelayResult<ControlFlow<()>>> + Send + 'static,
{
    supervisor.spawn(stage, async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    debug!(stage, "no longer accepting ticks");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if work().await?.is_break() {
                break;
            }
        }

        Ok(())
    });
}
