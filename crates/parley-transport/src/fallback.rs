//! Polling fallback.
//!
//! When a backend offers no usable push channel the adapter runs this loop:
//! fetch every row newer than the cursor minus the overlap window, let the
//! cursor drop what was already delivered, and infer presence from recent
//! senders. Failures are logged and retried on the next tick.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::adapter::{lock, to_chrono, AdapterShared};

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run poll ticks until aborted. The first tick runs immediately.
pub(crate) async fn run_poll_loop(shared: Arc<AdapterShared>) {
    let period = shared.settings.poll_interval.max(MIN_POLL_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(
        backend = %shared.backend.kind(),
        interval_ms = period.as_millis() as u64,
        "Poll loop started"
    );

    loop {
        ticker.tick().await;
        poll_once(&shared).await;
    }
}

/// One poll tick.
pub(crate) async fn poll_once(shared: &AdapterShared) {
    let from = lock(&shared.cursor).fetch_from();
    match shared.backend.fetch_since(from).await {
        Ok(rows) => shared.deliver_rows(rows),
        Err(e) => warn!(backend = %shared.backend.kind(), error = %e, "Poll fetch failed"),
    }
    refresh_presence(shared).await;
}

async fn refresh_presence(shared: &AdapterShared) {
    let since = Utc::now() - to_chrono(shared.settings.presence_window);
    match shared.backend.recent_activity(since).await {
        Ok(activity) => {
            let local = shared.local_identities();
            let users = lock(&shared.presence).infer_from_activity(&activity, &local);
            shared.emit(|sink| sink.on_presence(&users));
        }
        Err(e) => warn!(backend = %shared.backend.kind(), error = %e, "Presence inference failed"),
    }
}
