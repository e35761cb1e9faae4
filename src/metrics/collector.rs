use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters describing what the coordinator did
#[derive(Debug, Default)]
pub struct RefreshMetrics {
    /// Requests that entered `intercept`
    total_requests: AtomicU64,

    /// Refresh exchanges started
    refreshes: AtomicU64,

    /// Refresh exchanges that ended in failure
    refresh_failures: AtomicU64,

    /// Callers that joined an in-flight refresh
    queued: AtomicU64,

    /// Requests replayed with a new credential
    replays: AtomicU64,

    /// Forced sign-outs
    sign_outs: AtomicU64,

    /// Failures returned to callers, keyed by kind
    failures_by_kind: DashMap<String, AtomicU64>,
}

/// Point-in-time copy of [`RefreshMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub queued: u64,
    pub replays: u64,
    pub sign_outs: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
}

impl RefreshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sign_out(&self) {
        self.sign_outs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure handed back to a caller
    pub fn record_failure(&self, kind: &str) {
        self.failures_by_kind
            .entry(kind.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            sign_outs: self.sign_outs.load(Ordering::Relaxed),
            failures_by_kind: self
                .failures_by_kind
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}
