//! Network-quiescence bookkeeping.
//!
//! A single network-idle event misses chained `then → fetch → then → fetch`
//! sequences, so each worker tracks its own in-flight API-like requests and
//! waits until the count drains to zero and stays there for a quiet window.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use url::Url;

use crate::backend::{RequestInfo, ResourceKind};
use crate::config::MirrorConfig;

/// Whether a request participates in quiescence tracking: a supported verb
/// issued as fetch/xhr, or any request whose path looks API-like.
#[must_use]
pub fn is_trackable(request: &RequestInfo, config: &MirrorConfig) -> bool {
    if !crate::capture::api::is_supported_method(&request.method) {
        return false;
    }
    if matches!(request.kind, ResourceKind::Fetch | ResourceKind::Xhr) {
        return true;
    }
    Url::parse(&request.url)
        .map(|u| config.is_api_path(u.path()))
        .unwrap_or(false)
}

/// Per-worker in-flight request counter with a last-activity timestamp.
#[derive(Debug)]
pub struct InFlightTracker {
    epoch: Instant,
    pending: AtomicUsize,
    last_activity_ms: AtomicU64,
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            pending: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }
}

impl InFlightTracker {
    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn request_done(&self) {
        // Events can arrive out of order around navigation; never underflow
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.touch();
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Poll until the tracker reports zero pending requests for at least
/// `quiet_window`, bounded by `max_wait`. Returns whether quiescence was
/// reached inside the budget.
pub async fn wait_until_quiet(
    tracker: &InFlightTracker,
    quiet_window: Duration,
    max_wait: Duration,
    poll_interval: Duration,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if tracker.pending() == 0 && tracker.idle_for() >= quiet_window {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    tracker.pending() == 0 && tracker.idle_for() >= quiet_window
}
