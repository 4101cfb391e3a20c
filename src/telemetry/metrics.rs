//! Metrics collection for replication statistics.
//!
//! Provides thread-safe counters for the mirroring pipeline, shared by
//! every engine of a group.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for one mirror group.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    // Capture path
    /// Frames handed to `deliver`.
    pub delivered: Counter,
    /// Frames handed on untouched (inactive engine, unsupported traffic, capacity).
    pub passed_through: Counter,
    /// Records held in a connection queue.
    pub buffered: Counter,

    // Mirror transport
    /// Frames queued for the peer.
    pub mirrored_tx: Counter,
    /// Frames received from the peer.
    pub mirrored_rx: Counter,
    /// Peer frames injected toward the local guest.
    pub injected: Counter,
    /// Peer frames that could not be used as comparison copies.
    pub mirror_dropped: Counter,
    /// Mirror connections lost while running.
    pub transport_errors: Counter,
    /// Frames refused because the peer stopped draining the mirror queue.
    pub mirror_overflow: Counter,

    // Comparison
    /// Head pairs that matched.
    pub matched: Counter,
    /// Head pairs that diverged.
    pub diverged: Counter,
    /// Retransmitted segments released or dropped without a pair.
    pub retransmits: Counter,
    /// Records released downstream by comparison or flush.
    pub released: Counter,
    /// Flows that fell back to pass-through because the registry was full.
    pub capacity_exceeded: Counter,
    /// Held records released unpaired to keep a primary queue within its limit.
    pub overflow_released: Counter,

    // Checkpoints
    /// Checkpoint flushes run.
    pub checkpoints: Counter,
    /// Records handled by checkpoint flushes.
    pub flushed: Counter,

    /// Current number of tracked connections.
    pub connections: AtomicU64,
}

impl ProxyMetrics {
    /// Creates a new metrics set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the connection gauge.
    pub fn set_connections(&self, count: usize) {
        self.connections.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("delivered".into(), self.delivered.get()),
            ("passed_through".into(), self.passed_through.get()),
            ("buffered".into(), self.buffered.get()),
            ("mirrored_tx".into(), self.mirrored_tx.get()),
            ("mirrored_rx".into(), self.mirrored_rx.get()),
            ("injected".into(), self.injected.get()),
            ("mirror_dropped".into(), self.mirror_dropped.get()),
            ("transport_errors".into(), self.transport_errors.get()),
            ("mirror_overflow".into(), self.mirror_overflow.get()),
            ("matched".into(), self.matched.get()),
            ("diverged".into(), self.diverged.get()),
            ("retransmits".into(), self.retransmits.get()),
            ("released".into(), self.released.get()),
            ("capacity_exceeded".into(), self.capacity_exceeded.get()),
            ("overflow_released".into(), self.overflow_released.get()),
            ("checkpoints".into(), self.checkpoints.get()),
            ("flushed".into(), self.flushed.get()),
            (
                "connections".into(),
                self.connections.load(Ordering::Relaxed),
            ),
        ]
    }
}
