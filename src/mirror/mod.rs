//! Mirror transport
//!
//! Carries raw captured frames between the primary and secondary instance
//! of one protected interface over a dedicated TCP connection. Each frame is
//! an 8-byte big-endian length prefix followed by the frame bytes.

mod codec;
mod transport;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use transport::{
    accept_once, connect, FrameHandler, MirrorLink, MirrorSender, DEFAULT_QUEUE_DEPTH,
};
