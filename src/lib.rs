//! shadowlink - packet mirroring for primary/secondary VM replication
//!
//! Sits in a virtual NIC's packet pipeline, pairs every guest output packet
//! of the primary with the secondary's copy, releases matched output and
//! signals checkpoints or divergence to the replication controller.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod mirror;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
