//! Mirror engine instance
//!
//! One [`Engine`] protects one virtual interface on one side of the pair.
//! Frames enter through [`Engine::deliver`] on the capture path; released
//! frames leave through the [`PacketSink`] of the hosting pipeline. The
//! primary additionally runs a comparison task that drains connections
//! handed to it over an ordered work queue.
//!
//! Whenever the engine is not Running, `deliver` hands every frame straight
//! to the sink without touching the registry.

use super::checkpoint::CheckpointGate;
use super::classifier::{self, Disposition, RoleClassifier};
use super::compare::{self, Mismatch};
use super::connection::ConnectionKey;
use super::lock;
use super::packet::{Direction, EngineId, Packet, SenderId};
use super::registry::ConnectionRegistry;
use crate::config::{ProxyConfig, Role};
use crate::mirror::{self, FrameCodec, FrameHandler, MirrorLink, MirrorSender};
use crate::telemetry::ProxyMetrics;
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outbound boundary toward the next stage of the hosting pipeline
pub trait PacketSink: Send + Sync {
    /// Hand a frame on along the path identified by `sender` and `direction`
    fn pass_to_next(&self, frame: &[u8], sender: SenderId, direction: Direction);
}

/// Signals raised toward the replication controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Primary and secondary produced different output on a flow
    Divergence {
        engine: EngineId,
        name: String,
        key: ConnectionKey,
        mismatch: Mismatch,
    },
    /// The mirror connection failed; the engine has stopped and fails open
    TransportLost {
        engine: EngineId,
        name: String,
        reason: String,
    },
    /// The pending-checkpoint flag was raised by the data path
    CheckpointRequested { engine: EngineId, name: String },
}

/// Work items for the primary's comparison task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareWork {
    /// This connection has a pair (or a lone retransmit) to drain
    Ready(ConnectionKey),
    Shutdown,
}

/// Engine lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Inactive,
    Running,
    /// Terminal
    Stopped,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStatus::Inactive => write!(f, "inactive"),
            LifecycleStatus::Running => write!(f, "running"),
            LifecycleStatus::Stopped => write!(f, "stopped"),
        }
    }
}

const INACTIVE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Atomic status read on every delivered frame
#[derive(Debug, Default)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn status(&self) -> LifecycleStatus {
        match self.0.load(Ordering::Acquire) {
            INACTIVE => LifecycleStatus::Inactive,
            RUNNING => LifecycleStatus::Running,
            _ => LifecycleStatus::Stopped,
        }
    }

    fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }

    fn set_running(&self) -> bool {
        self.0
            .compare_exchange(INACTIVE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the previous status
    fn stop(&self) -> LifecycleStatus {
        match self.0.swap(STOPPED, Ordering::AcqRel) {
            INACTIVE => LifecycleStatus::Inactive,
            RUNNING => LifecycleStatus::Running,
            _ => LifecycleStatus::Stopped,
        }
    }

    /// Running -> Stopped only; true if this call made the transition
    fn fail(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Per-instance settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub role: Role,
    /// Peer address (primary) or listen address (secondary)
    pub addr: String,
    pub max_frame_size: usize,
    pub max_queue_depth: usize,
    pub mirror_queue_depth: usize,
}

impl EngineSettings {
    pub fn new(role: Role, addr: impl Into<String>) -> Self {
        Self {
            role,
            addr: addr.into(),
            max_frame_size: mirror::DEFAULT_MAX_FRAME_SIZE,
            max_queue_depth: crate::config::DEFAULT_MAX_QUEUE_DEPTH,
            mirror_queue_depth: mirror::DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Settings for one `[proxies.<name>]` table.
    ///
    /// Fails with [`Error::Config`] on a missing or malformed address or a
    /// direction other than `all`.
    pub fn from_config(proxy: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            role: proxy.role,
            addr: proxy.endpoint()?,
            max_frame_size: proxy.max_frame_size,
            max_queue_depth: proxy.max_queue_depth,
            mirror_queue_depth: proxy.mirror_queue_depth,
        })
    }
}

/// Group-wide state handed to every engine of a group
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) gate: Arc<CheckpointGate>,
    pub(crate) metrics: Arc<ProxyMetrics>,
    pub(crate) events: mpsc::UnboundedSender<ProxyEvent>,
}

/// Live handles that exist only while Running
#[derive(Default)]
struct Links {
    mirror: Option<MirrorSender>,
    work: Option<mpsc::UnboundedSender<CompareWork>>,
}

/// Task handles owned by the engine, joined or aborted on stop
#[derive(Default)]
struct Tasks {
    link: Option<MirrorLink>,
    compare: Option<JoinHandle<()>>,
}

/// State shared between the capture path, the mirror reader and the
/// comparison task
pub(crate) struct EngineCore {
    pub(crate) id: EngineId,
    pub(crate) name: String,
    pub(crate) settings: EngineSettings,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) gate: Arc<CheckpointGate>,
    pub(crate) metrics: Arc<ProxyMetrics>,
    sink: Arc<dyn PacketSink>,
    events: mpsc::UnboundedSender<ProxyEvent>,
    classifier: Box<dyn RoleClassifier>,
    lifecycle: Lifecycle,
    links: Mutex<Links>,
}

impl EngineCore {
    pub(crate) fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Hand a frame to the next pipeline stage
    pub(crate) fn pass_to_next(&self, frame: &[u8], sender: SenderId, direction: Direction) {
        self.sink.pass_to_next(frame, sender, direction);
    }

    /// Forward records released by comparison or flush, in order
    pub(crate) fn release(&self, records: Vec<Packet>) {
        self.metrics.released.add(records.len() as u64);
        for record in records {
            self.sink
                .pass_to_next(record.data(), record.sender(), record.direction());
        }
    }

    /// Queue a frame for the peer. Returns false if there is no live link.
    ///
    /// A peer that has stopped draining its queue fails the engine open.
    /// Must not be called with a connection lock held.
    pub(crate) fn send_mirror(&self, frame: &[u8]) -> bool {
        let Some(sender) = lock(&self.links).mirror.clone() else {
            return false;
        };
        match sender.send(frame) {
            Ok(()) => {
                self.metrics.mirrored_tx.inc();
                true
            }
            Err(e @ Error::QueueFull { .. }) => {
                self.metrics.mirror_overflow.inc();
                self.on_closed(e);
                false
            }
            Err(e) => {
                debug!(engine = %self.id, error = %e, "mirror send failed");
                false
            }
        }
    }

    /// Hand a connection to the comparison task. If there is no task to
    /// take it, the claim is given back so a later pass can schedule it.
    pub(crate) fn schedule(&self, key: ConnectionKey) {
        let work = lock(&self.links).work.clone();
        if let Some(work) = work {
            if work.send(CompareWork::Ready(key)).is_ok() {
                return;
            }
        }
        debug!(engine = %self.id, %key, "no comparison task, left for flush");
        if let Some(conn) = self.registry.get(&key) {
            lock(&conn).finish_processing();
        }
    }

    /// Raise the pending-checkpoint flag and report it once
    pub(crate) fn request_checkpoint(&self) {
        if self.gate.request() {
            info!(engine = %self.id, name = %self.name, "checkpoint requested by data path");
            self.emit(ProxyEvent::CheckpointRequested {
                engine: self.id,
                name: self.name.clone(),
            });
        }
    }

    fn emit(&self, event: ProxyEvent) {
        // receiver may be gone when nobody listens for events
        let _ = self.events.send(event);
    }

    /// Drain one connection and forward what matched
    pub(crate) fn compare_connection(&self, key: ConnectionKey) {
        let Some(conn) = self.registry.get(&key) else {
            return;
        };

        let divergence = {
            let mut conn = lock(&conn);
            if conn.is_detached() {
                return;
            }
            let outcome = compare::drain(&mut conn);
            conn.finish_processing();

            self.metrics.matched.add(outcome.matched as u64);
            self.metrics.retransmits.add(outcome.retransmits as u64);
            if !outcome.released.is_empty() {
                debug!(
                    engine = %self.id,
                    %key,
                    released = outcome.released.len(),
                    discarded = outcome.discarded,
                    "pairs matched"
                );
            }
            // under the connection lock, so releases of one flow stay in order
            self.release(outcome.released);
            outcome.divergence
        };

        if let Some(mismatch) = divergence {
            self.metrics.diverged.inc();
            error!(engine = %self.id, name = %self.name, %key, %mismatch, "output diverged");
            self.gate.request();
            self.emit(ProxyEvent::Divergence {
                engine: self.id,
                name: self.name.clone(),
                key,
                mismatch,
            });
        }

    }

    /// Visit every connection with a ready pair; used while a checkpoint is
    /// pending so the registry drains toward quiescence.
    fn drain_ready(&self) {
        for (key, conn) in self.registry.snapshot() {
            if lock(&conn).try_schedule() {
                self.compare_connection(key);
            }
        }
    }

    /// Release or discard every record this engine captured
    pub(crate) fn flush(&self) -> (usize, usize) {
        let (released, discarded) = self.classifier.flush(self);
        self.metrics.flushed.add((released + discarded) as u64);
        (released, discarded)
    }

    /// Tear down live links after a stop or failure
    fn take_links(&self) -> Links {
        std::mem::take(&mut *lock(&self.links))
    }
}

impl FrameHandler for EngineCore {
    fn on_frame(&self, frame: Vec<u8>) {
        if !self.is_running() {
            return;
        }
        self.metrics.mirrored_rx.inc();
        self.classifier.on_mirror_frame(self, frame);
    }

    fn on_closed(&self, error: Error) {
        if !self.lifecycle.fail() {
            return;
        }
        self.metrics.transport_errors.inc();
        error!(engine = %self.id, name = %self.name, %error, "mirror transport lost, failing open");

        let links = self.take_links();
        if let Some(work) = links.work {
            let _ = work.send(CompareWork::Shutdown);
        }
        let (released, discarded) = self.flush();
        info!(engine = %self.id, released, discarded, "held output flushed");

        self.emit(ProxyEvent::TransportLost {
            engine: self.id,
            name: self.name.clone(),
            reason: error.to_string(),
        });
    }
}

async fn run_comparison(core: Arc<EngineCore>, mut work: mpsc::UnboundedReceiver<CompareWork>) {
    debug!("comparison task started");
    while let Some(item) = work.recv().await {
        match item {
            CompareWork::Ready(key) => core.compare_connection(key),
            CompareWork::Shutdown => break,
        }
        if core.gate.is_pending() {
            core.drain_ready();
        }
    }
    debug!("comparison task finished");
}

/// Handle to one mirror engine instance
#[derive(Clone)]
pub struct Engine {
    core: Arc<EngineCore>,
    tasks: Arc<Mutex<Tasks>>,
}

impl Engine {
    pub(crate) fn new(
        id: EngineId,
        name: impl Into<String>,
        settings: EngineSettings,
        shared: Shared,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let classifier = classifier::for_role(settings.role);
        let core = EngineCore {
            id,
            name: name.into(),
            settings,
            registry: shared.registry,
            gate: shared.gate,
            metrics: shared.metrics,
            sink,
            events: shared.events,
            classifier,
            lifecycle: Lifecycle::default(),
            links: Mutex::new(Links::default()),
        };
        Self {
            core: Arc::new(core),
            tasks: Arc::new(Mutex::new(Tasks::default())),
        }
    }

    pub fn id(&self) -> EngineId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn role(&self) -> Role {
        self.core.settings.role
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.core.settings
    }

    pub fn status(&self) -> LifecycleStatus {
        self.core.lifecycle.status()
    }

    /// Accept one frame from the hosting pipeline.
    ///
    /// Always reports the whole frame as consumed: it is either handed on,
    /// held for comparison or mirrored, never dropped.
    pub fn deliver(&self, frame: &[u8], sender: SenderId, direction: Direction) -> usize {
        let core = &self.core;
        core.metrics.delivered.inc();

        if !core.is_running() {
            core.metrics.passed_through.inc();
            core.pass_to_next(frame, sender, direction);
            return frame.len();
        }

        let packet = match Packet::capture(frame.to_vec(), core.id, sender, direction) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(engine = %core.id, error = %e, "not tracked, passing through");
                core.metrics.passed_through.inc();
                core.pass_to_next(frame, sender, direction);
                return frame.len();
            }
        };

        match core.classifier.classify(core, packet) {
            Disposition::PassThrough(packet) => {
                core.metrics.passed_through.inc();
                core.pass_to_next(packet.data(), sender, direction);
            }
            Disposition::MirroredThrough(packet) => {
                core.pass_to_next(packet.data(), sender, direction);
            }
            Disposition::Buffered | Disposition::BufferedAndMirrored => {
                core.metrics.buffered.inc();
            }
        }
        frame.len()
    }

    /// Establish the mirror connection and start processing.
    ///
    /// The primary connects to its peer and spawns the comparison task; the
    /// secondary accepts exactly one peer. Starting a stopped engine is an
    /// error; starting a running one does nothing.
    pub async fn start(&self) -> Result<()> {
        match self.status() {
            LifecycleStatus::Running => return Ok(()),
            LifecycleStatus::Stopped => {
                return Err(Error::InvalidState(format!(
                    "{} ({}) is stopped",
                    self.core.name, self.core.id
                )))
            }
            LifecycleStatus::Inactive => {}
        }

        let settings = &self.core.settings;
        let span = info_span!("engine", id = self.core.id.0, name = %self.core.name, role = %settings.role);
        let stream = match settings.role {
            Role::Primary => mirror::connect(&settings.addr).instrument(span.clone()).await?,
            Role::Secondary => mirror::accept_once(&settings.addr).instrument(span.clone()).await?,
        };

        // links go in before Running so no frame is classified without them
        let codec = FrameCodec::new(settings.max_frame_size);
        let handler: Arc<dyn FrameHandler> = self.core.clone();
        let link = MirrorLink::spawn(stream, codec, settings.mirror_queue_depth, handler)?;
        let peer = link.peer_addr();

        let compare = match settings.role {
            Role::Primary => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&self.core.links).work = Some(tx);
                Some(tokio::spawn(
                    run_comparison(Arc::clone(&self.core), rx).instrument(span),
                ))
            }
            Role::Secondary => None,
        };
        lock(&self.core.links).mirror = Some(link.sender());
        {
            let mut tasks = lock(&self.tasks);
            tasks.link = Some(link);
            tasks.compare = compare;
        }

        // stop() may have run while we were waiting for the peer
        if !self.core.lifecycle.set_running() {
            let links = self.core.take_links();
            if let Some(work) = links.work {
                let _ = work.send(CompareWork::Shutdown);
            }
            if let Some(link) = lock(&self.tasks).link.take() {
                link.close();
            }
            return Err(Error::InvalidState(format!(
                "{} stopped during start",
                self.core.name
            )));
        }

        info!(engine = %self.core.id, name = %self.core.name, role = %settings.role, %peer, "engine running");
        Ok(())
    }

    /// Stop the engine for good.
    ///
    /// Marks it Stopped first so new frames pass straight through, closes
    /// the mirror connection, flushes held records, then shuts down and
    /// joins the comparison task. Must not run concurrently with itself.
    pub async fn stop(&self) {
        let previous = self.core.lifecycle.stop();

        let links = self.core.take_links();
        let (link, compare) = {
            let mut tasks = lock(&self.tasks);
            (tasks.link.take(), tasks.compare.take())
        };
        if let Some(link) = link {
            link.close();
        }

        if previous == LifecycleStatus::Running {
            let (released, discarded) = self.core.flush();
            info!(engine = %self.core.id, name = %self.core.name, released, discarded, "engine stopped");
        } else {
            debug!(engine = %self.core.id, %previous, "stop on non-running engine");
        }

        if let Some(work) = links.work {
            let _ = work.send(CompareWork::Shutdown);
        }
        drop(links.mirror);
        if let Some(handle) = compare {
            if let Err(e) = handle.await {
                warn!(engine = %self.core.id, error = %e, "comparison task ended abnormally");
            }
        }
    }

    /// Flush this engine's held records for a checkpoint
    pub(crate) fn flush(&self) -> (usize, usize) {
        self.core.flush()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("role", &self.core.settings.role)
            .field("status", &self.status())
            .finish()
    }
}
