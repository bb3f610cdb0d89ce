//! Control plane metrics.
//!
//! Counters are `AtomicU64` so recording never takes a lock. All counters are
//! monotonic; computing rates is the reader's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::proxy::ConnectionObserver;

/// Lifecycle counters, written by the coordinator and orchestrators.
#[derive(Debug, Default)]
pub struct ControlPlaneMetricsStorage {
    pub(crate) transitions_started: AtomicU64,
    pub(crate) transitions_completed: AtomicU64,
    pub(crate) transitions_failed: AtomicU64,
    pub(crate) snapshots_created: AtomicU64,
    pub(crate) snapshots_failed: AtomicU64,
    pub(crate) compensating_kills: AtomicU64,
}

impl ControlPlaneMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transition_started(&self) {
        self.transitions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition_completed(&self) {
        self.transitions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition_failed(&self) {
        self.transitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_created(&self) {
        self.snapshots_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_failed(&self) {
        self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compensating_kill(&self) {
        self.compensating_kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transitions_completed(&self) -> u64 {
        self.transitions_completed.load(Ordering::Relaxed)
    }

    pub fn transitions_failed(&self) -> u64 {
        self.transitions_failed.load(Ordering::Relaxed)
    }
}

/// Read-only view over [`ControlPlaneMetricsStorage`].
#[derive(Clone, Debug)]
pub struct ControlPlaneMetrics {
    storage: Arc<ControlPlaneMetricsStorage>,
}

impl ControlPlaneMetrics {
    pub fn new(storage: Arc<ControlPlaneMetricsStorage>) -> Self {
        Self { storage }
    }

    /// Transitions that committed a new state.
    pub fn transitions_started(&self) -> u64 {
        self.storage.transitions_started.load(Ordering::Relaxed)
    }

    /// Transitions finished with success.
    pub fn transitions_completed(&self) -> u64 {
        self.storage.transitions_completed()
    }

    /// Transitions finished with an error.
    pub fn transitions_failed(&self) -> u64 {
        self.storage.transitions_failed()
    }

    /// Transitions begun but not yet finished.
    pub fn transitions_in_flight(&self) -> u64 {
        self.transitions_started()
            .saturating_sub(self.transitions_completed() + self.transitions_failed())
    }

    pub fn snapshots_created(&self) -> u64 {
        self.storage.snapshots_created.load(Ordering::Relaxed)
    }

    pub fn snapshots_failed(&self) -> u64 {
        self.storage.snapshots_failed.load(Ordering::Relaxed)
    }

    /// Kills issued after a failed checkpoint.
    pub fn compensating_kills(&self) -> u64 {
        self.storage.compensating_kills.load(Ordering::Relaxed)
    }
}

/// Connection counters for the proxy admission path.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    acquired: AtomicU64,
    blocked: AtomicU64,
    released: AtomicU64,
    peak_per_sandbox: AtomicU64,
    held_ms_total: AtomicU64,
}

impl ProxyMetrics {
    pub fn connections_acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn connections_blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn connections_released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Highest concurrent connection count seen on any single sandbox.
    pub fn peak_connections_per_sandbox(&self) -> u64 {
        self.peak_per_sandbox.load(Ordering::Relaxed)
    }

    /// Sum of connection durations, in milliseconds.
    pub fn connection_time_ms_total(&self) -> u64 {
        self.held_ms_total.load(Ordering::Relaxed)
    }
}

impl ConnectionObserver for ProxyMetrics {
    fn on_acquired(&self, _sandbox_id: &str, count: usize) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.peak_per_sandbox
            .fetch_max(count as u64, Ordering::Relaxed);
    }

    fn on_blocked(&self, _sandbox_id: &str, _limit: usize) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    fn on_released(&self, _sandbox_id: &str, held: Duration) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.held_ms_total
            .fetch_add(held.as_millis() as u64, Ordering::Relaxed);
    }
}
