//! Length-prefixed frame codec

use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix on the wire
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// 64 KiB of payload plus 4 KiB of headroom
pub const DEFAULT_MAX_FRAME_SIZE: usize = 69632;

/// Encodes and decodes `[length: u64 BE][payload]` frames.
///
/// Valid payload lengths are in `(0, max_frame_size)`; zero-length frames
/// are never produced and are rejected on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Validate a payload length
    pub fn check_len(&self, len: u64) -> Result<usize> {
        if len == 0 || len >= self.max_frame_size as u64 {
            return Err(Error::FrameLength {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(len as usize)
    }

    /// Append one encoded frame to `dst`
    pub fn encode(&self, payload: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        self.check_len(payload.len() as u64)?;
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        dst.extend_from_slice(payload);
        Ok(())
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns the payload and the number of bytes consumed, or `None` if
    /// `src` does not yet hold a complete frame.
    pub fn decode(&self, src: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let Some(prefix) = src.get(..LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(prefix);
        let len = self.check_len(u64::from_be_bytes(len_bytes))?;

        let end = LENGTH_PREFIX_SIZE + len;
        match src.get(LENGTH_PREFIX_SIZE..end) {
            Some(payload) => Ok(Some((payload.to_vec(), end))),
            None => Ok(None),
        }
    }

    /// Read one frame.
    ///
    /// Returns `None` on a clean end of stream at a frame boundary. The full
    /// payload is read before returning.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Transport(
                    "peer closed inside a length prefix".into(),
                ));
            }
            filled += n;
        }

        let len = self.check_len(u64::from_be_bytes(prefix))?;
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Transport(format!("short frame payload: {}", e)))?;
        Ok(Some(payload))
    }

    /// Write one frame and flush it
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        self.encode(payload, &mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
