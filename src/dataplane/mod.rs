//! Data plane components
//!
//! Handles packet replication: capture records, flow tracking, mirroring,
//! output comparison and the checkpoint control surface.

mod checkpoint;
mod classifier;
mod compare;
mod connection;
mod engine;
mod group;
pub(crate) mod packet;
mod registry;

pub use checkpoint::{CheckpointGate, CheckpointOutcome};
pub use compare::{DrainOutcome, Mismatch, ProtocolState, Side, Verdict};
pub use connection::{ComparisonState, Connection, ConnectionKey, FlushedRecords};
pub use engine::{CompareWork, Engine, EngineSettings, LifecycleStatus, PacketSink, ProxyEvent};
pub use group::{GroupSettings, MirrorGroup};
pub use packet::{Direction, EngineId, Packet, SenderId};
pub use registry::{ConnectionRef, ConnectionRegistry};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
