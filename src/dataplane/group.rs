//! Mirror group
//!
//! Owns the connection registry and checkpoint flag shared by every engine
//! on one host, and exposes the control surface used by the replication
//! controller: start/stop per role, checkpoint negotiation and events.

use super::checkpoint::{CheckpointGate, CheckpointOutcome};
use super::engine::{Engine, EngineSettings, PacketSink, ProxyEvent, Shared};
use super::packet::EngineId;
use super::registry::{ConnectionRegistry, DEFAULT_MAX_CONNECTIONS};
use crate::config::{Config, Role};
use crate::telemetry::ProxyMetrics;
use crate::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Registry bounds for a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub max_connections: usize,
    /// Idle connections older than this are evicted at checkpoints
    pub idle_timeout: Duration,
}

impl GroupSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.registry.max_connections,
            idle_timeout: config.registry.idle_timeout(),
        }
    }
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// All engines of one host plus their shared state
pub struct MirrorGroup {
    shared: Shared,
    engines: Vec<Engine>,
    events: Option<mpsc::UnboundedReceiver<ProxyEvent>>,
    idle_timeout: Duration,
    /// Gated attempts deferred since the last checkpoint
    deferrals: AtomicU32,
}

impl MirrorGroup {
    pub fn new(settings: GroupSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            registry: Arc::new(ConnectionRegistry::new(settings.max_connections)),
            gate: Arc::new(CheckpointGate::new()),
            metrics: Arc::new(ProxyMetrics::new()),
            events: tx,
        };
        Self {
            shared,
            engines: Vec::new(),
            events: Some(rx),
            idle_timeout: settings.idle_timeout,
            deferrals: AtomicU32::new(0),
        }
    }

    /// Create an engine bound to this group's registry.
    ///
    /// The returned handle is what the capture path calls `deliver` on.
    pub fn add_engine(
        &mut self,
        name: impl Into<String>,
        settings: EngineSettings,
        sink: Arc<dyn PacketSink>,
    ) -> Engine {
        let id = EngineId(self.engines.len() as u32 + 1);
        let engine = Engine::new(id, name, settings, self.shared.clone(), sink);
        debug!(engine = %id, name = engine.name(), role = %engine.role(), "engine added");
        self.engines.push(engine.clone());
        engine
    }

    pub fn engines(&self) -> &[Engine] {
        &self.engines
    }

    pub fn engine(&self, name: &str) -> Option<&Engine> {
        self.engines.iter().find(|e| e.name() == name)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.shared.metrics
    }

    /// Receiver for divergence, transport-loss and checkpoint-request
    /// events. Only the first call gets it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProxyEvent>> {
        self.events.take()
    }

    /// Start every engine of `role`, in the order they were added
    pub async fn start_all(&self, role: Role) -> Result<()> {
        for engine in self.engines.iter().filter(|e| e.role() == role) {
            engine.start().await?;
        }
        info!(%role, "engines started");
        Ok(())
    }

    /// Stop every engine of `role`
    pub async fn stop_all(&self, role: Role) {
        for engine in self.engines.iter().filter(|e| e.role() == role) {
            engine.stop().await;
        }
        self.shared.metrics.set_connections(self.shared.registry.len());
        info!(%role, "engines stopped");
    }

    /// Whether a checkpoint has been asked for and not yet taken
    pub fn query_checkpoint_pending(&self) -> bool {
        self.shared.gate.is_pending()
    }

    /// Record that the replication controller wants a checkpoint
    pub fn notify_checkpoint_requested(&self) {
        if self.shared.gate.request() {
            debug!("checkpoint requested by controller");
        }
    }

    /// True when every connection is Idle
    pub fn checkpoint_safe(&self) -> bool {
        self.shared.registry.is_quiescent()
    }

    /// Take a checkpoint if every connection is Idle, otherwise defer.
    pub fn try_checkpoint(&self) -> CheckpointOutcome {
        if !self.checkpoint_safe() {
            let deferred = self.deferrals.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(deferred, "checkpoint deferred, comparisons outstanding");
            return CheckpointOutcome::Deferred;
        }
        self.checkpoint()
    }

    /// Like [`try_checkpoint`](Self::try_checkpoint), but once `max_deferrals`
    /// attempts in a row have been deferred the checkpoint is forced. A
    /// flow whose copies never arrive, or that diverged, cannot hold
    /// output past that point.
    pub fn checkpoint_within(&self, max_deferrals: u32) -> CheckpointOutcome {
        match self.try_checkpoint() {
            CheckpointOutcome::Deferred
                if self.deferrals.load(Ordering::Relaxed) >= max_deferrals =>
            {
                warn!(max_deferrals, "checkpoint deferred too often, forcing");
                self.force_checkpoint()
            }
            outcome => outcome,
        }
    }

    /// Take a checkpoint regardless of outstanding comparisons: held primary
    /// output is released and diverged connections are reset.
    pub fn force_checkpoint(&self) -> CheckpointOutcome {
        info!("forcing checkpoint");
        self.checkpoint()
    }

    fn checkpoint(&self) -> CheckpointOutcome {
        let mut released = 0;
        let mut discarded = 0;
        for engine in &self.engines {
            let (r, d) = engine.flush();
            released += r;
            discarded += d;
        }

        let registry = &self.shared.registry;
        let expired = registry.expire_idle(self.idle_timeout);
        self.shared.gate.clear();
        self.deferrals.store(0, Ordering::Relaxed);

        let metrics = &self.shared.metrics;
        metrics.checkpoints.inc();
        metrics.set_connections(registry.len());
        info!(released, discarded, expired, connections = registry.len(), "checkpoint completed");

        CheckpointOutcome::Completed {
            released,
            discarded,
        }
    }
}

impl Default for MirrorGroup {
    fn default() -> Self {
        Self::new(GroupSettings::default())
    }
}
