//! Periodic liveness invocations.
//!
//! A failed or unexpected ping is only logged. Reconnection is driven by the
//! read side, never by this loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use super::connection::Inner;

/// Ping every `interval` while the client is ready, until shutdown.
pub(crate) async fn run(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::debug!("[Liveness] Pinging every {interval:?}");

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !inner.is_ready() {
            log::trace!("[Liveness] Not ready, skipping ping");
            continue;
        }

        // Each ping gets its own task so a slow reply never delays the next tick.
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            match inner.ping().await {
                Ok(()) => log::trace!("[Liveness] Pong"),
                Err(e) => log::warn!("[Liveness] Ping failed: {e}"),
            }
        });
    }
    log::debug!("[Liveness] Stopped");
}
