//! Pending-checkpoint flag

use std::sync::atomic::{AtomicBool, Ordering};

/// Result of a checkpoint attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Held output was flushed and the pending flag cleared
    Completed { released: usize, discarded: usize },
    /// Some connection was not Idle; nothing was touched
    Deferred,
}

/// Group-wide flag telling the comparison path that a checkpoint is wanted.
///
/// Raised by the replication controller, by queue overflow and by
/// divergence; cleared when a checkpoint completes.
#[derive(Debug, Default)]
pub struct CheckpointGate {
    pending: AtomicBool,
}

impl CheckpointGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true if it was not already raised.
    pub fn request(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }
}
