//! Repeating an operation at a fixed period until cancelled.

use futures::{Stream, StreamExt as _};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `tick` right away and then every `period`, yielding each outcome.
///
/// A tick never overlaps the previous one: if `tick` takes longer than `period`, the next tick
/// starts as soon as it finishes and the schedule shifts. Once `cancel` fires no new tick is
/// started; a tick already in progress is allowed to finish.
pub fn periodic<F, Fut>(
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> impl Stream<Item = Fut::Output>
where
    F: FnMut() -> Fut,
    Fut: Future,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    IntervalStream::new(interval)
        .take_until(cancel.cancelled_owned())
        .then(move |instant| {
            debug!(message = "tick", ?instant);
            tick()
        })
}

/// A token that is cancelled once the user presses Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(
                message = "could not listen for Ctrl-C",
                error = (&e as &dyn std::error::Error)
            );
            return;
        }
        debug!("Ctrl-C received, stopping");
        cancel.cancel();
    });
    token
}
