use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("interface {name} not found")]
    InterfaceNotFound { name: String },

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("unsupported traffic: {0}")]
    Unsupported(String),

    #[error("connection registry full ({max} entries)")]
    CapacityExceeded { max: usize },

    #[error("mirror transport error: {0}")]
    Transport(String),

    #[error("mirror queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    #[error("mirror frame length {len} outside (0, {max})")]
    FrameLength { len: u64, max: usize },

    #[error("invalid engine state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
