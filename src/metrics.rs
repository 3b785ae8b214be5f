use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

/// Counters and per-shard gauges for the gateway.
///
/// Use `snapshot()` for a consistent point-in-time view, or the individual
/// getters for single values.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    dispatches_total: AtomicU64,
    dispatch_errors_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    heartbeat_failures_total: AtomicU64,
    invalidated_keys_total: AtomicU64,

    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone, Default)]
pub struct ShardMetrics {
    pub shard_index: u32,
    pub is_connected: bool,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Current reconnection attempt (0 if connected)
    pub reconnect_attempt: u32,
    /// Last dispatch sequence seen
    pub sequence: Option<u64>,
    /// Heartbeat round trip
    pub latency: Option<Duration>,
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn dispatch_errors(&self) -> u64 {
        self.dispatch_errors_total.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    pub fn heartbeat_failures(&self) -> u64 {
        self.heartbeat_failures_total.load(Ordering::Relaxed)
    }

    pub fn invalidated_keys(&self) -> u64 {
        self.invalidated_keys_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch_error(&self) {
        self.dispatch_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidated_keys(&self, count: usize) {
        self.invalidated_keys_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_index: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards.entry(shard_index).or_insert_with(|| ShardMetrics {
            shard_index,
            ..Default::default()
        });
        update_fn(entry);
    }

    pub(crate) fn shard_connected(&self, shard_index: u32) {
        self.update_shard(shard_index, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
            s.reconnect_attempt = 0;
        });
    }

    pub(crate) fn shard_disconnected(&self, shard_index: u32) {
        self.update_shard(shard_index, |s| {
            if s.is_connected {
                if let Some(connected_at) = s.last_connected_at {
                    s.total_uptime += connected_at.elapsed();
                }
            }
            s.is_connected = false;
        });
    }

    /// Snapshot of one shard, if it was ever seen
    pub fn shard(&self, shard_index: u32) -> Option<ShardMetrics> {
        self.shard_metrics.read().get(&shard_index).map(|s| s.snapshot())
    }

    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            dispatch_errors_total: self.dispatch_errors_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            heartbeat_failures_total: self.heartbeat_failures_total.load(Ordering::Acquire),
            invalidated_keys_total: self.invalidated_keys_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub dispatches_total: u64,
    pub dispatch_errors_total: u64,
    pub messages_sent_total: u64,
    pub errors_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub heartbeat_failures_total: u64,
    pub invalidated_keys_total: u64,
    pub active_connections: usize,
    pub shards: Vec<ShardMetrics>,
}
