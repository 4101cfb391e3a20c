//! Mirror connection tasks
//!
//! The primary connects to the secondary's listen address; the secondary
//! binds, accepts exactly one peer and stops listening. Once established
//! the stream is split into a reader task that hands every received frame
//! to a [`FrameHandler`] and a writer task fed through a bounded queue.
//! The capture path never waits on the peer: a full queue is refused with
//! [`Error::QueueFull`]. There is no reconnection: any read or write
//! failure is reported once through [`FrameHandler::on_closed`].

use super::codec::FrameCodec;
use crate::{Error, Result};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// Outbound frames a link buffers before refusing more
pub const DEFAULT_QUEUE_DEPTH: usize = 4096;

/// Receives what arrives on a mirror connection
pub trait FrameHandler: Send + Sync + 'static {
    /// One complete frame from the peer
    fn on_frame(&self, frame: Vec<u8>);

    /// The connection failed or the peer closed it
    fn on_closed(&self, error: Error);
}

/// Queue handle for outbound frames
#[derive(Debug, Clone)]
pub struct MirrorSender {
    tx: mpsc::Sender<Vec<u8>>,
    codec: FrameCodec,
}

impl MirrorSender {
    /// Queue one frame for the peer without waiting.
    ///
    /// Lengths outside the codec's bounds are rejected here so a
    /// zero-length frame never reaches the wire. A peer that stops reading
    /// shows up as [`Error::QueueFull`] once the queue is exhausted.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        self.codec.check_len(frame.len() as u64)?;
        self.tx.try_send(frame.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull {
                capacity: self.tx.max_capacity(),
            },
            TrySendError::Closed(_) => Error::Transport("mirror writer closed".into()),
        })
    }
}

/// An established mirror connection and its two tasks
#[derive(Debug)]
pub struct MirrorLink {
    sender: MirrorSender,
    peer: SocketAddr,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MirrorLink {
    /// Split `stream` and spawn its reader and writer tasks. At most
    /// `queue_depth` outbound frames wait for the writer.
    pub fn spawn(
        stream: TcpStream,
        codec: FrameCodec,
        queue_depth: usize,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Self> {
        if queue_depth == 0 {
            return Err(Error::Config("mirror queue depth must be greater than 0".into()));
        }
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(queue_depth);

        let reader = tokio::spawn(read_loop(read_half, codec, Arc::clone(&handler)));
        let writer = tokio::spawn(write_loop(write_half, codec, rx, handler));

        Ok(Self {
            sender: MirrorSender { tx, codec },
            peer,
            reader,
            writer,
        })
    }

    pub fn sender(&self) -> MirrorSender {
        self.sender.clone()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Stop both tasks. Frames still queued are dropped and the handler is
    /// not notified.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
        debug!(peer = %self.peer, "mirror link closed");
    }
}

async fn read_loop(mut reader: OwnedReadHalf, codec: FrameCodec, handler: Arc<dyn FrameHandler>) {
    loop {
        match codec.read_frame(&mut reader).await {
            Ok(Some(frame)) => handler.on_frame(frame),
            Ok(None) => {
                handler.on_closed(Error::Transport("peer closed the mirror connection".into()));
                return;
            }
            Err(e) => {
                handler.on_closed(e);
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    codec: FrameCodec,
    mut rx: mpsc::Receiver<Vec<u8>>,
    handler: Arc<dyn FrameHandler>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = codec.write_frame(&mut writer, &frame).await {
            handler.on_closed(e);
            return;
        }
    }
    // every sender dropped
    let _ = writer.shutdown().await;
}

/// Connect to a listening secondary.
///
/// Retries briefly while the peer is not yet listening; any other failure
/// is returned at once.
pub async fn connect(addr: &str) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(%addr, "mirror connection established");
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::ConnectionRefused && attempt + 1 < CONNECT_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                warn!(%addr, error = %e, "mirror connect failed");
                return Err(Error::Transport(format!("connect {}: {}", addr, e)));
            }
        }
    }
}

/// Bind `addr`, accept one peer, then stop listening
pub async fn accept_once(addr: &str) -> Result<TcpStream> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(format!("bind {}: {}", addr, e)))?;
    info!(%addr, "waiting for mirror peer");

    let (stream, peer) = listener.accept().await?;
    drop(listener);
    info!(%peer, "mirror peer accepted");
    Ok(stream)
}
