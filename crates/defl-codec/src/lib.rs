//! Length-delimited framing over any duplex byte stream.
//!
//! The length prefix is big-endian and of configurable byte width: the
//! committer uses an 8-byte prefix, legacy/test tooling a 4-byte one. A
//! short read at any point (peer closed mid-frame) surfaces as
//! [`FrameError::ShortRead`] rather than panicking — callers are expected
//! to tear the connection down and reconnect, not retry in place.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Widest length prefix this codec supports. `u64` holds any frame size
/// a sane peer would send; nothing here needs more.
const MAX_PREFIX_WIDTH: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed connection mid-frame")]
    ShortRead,
    #[error("length prefix width must be 1..={MAX_PREFIX_WIDTH}, got {0}")]
    InvalidWidth(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A length-delimited frame codec with a configurable prefix width.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    length_field_width: usize,
}

impl FrameCodec {
    /// `length_field_width` is the number of big-endian bytes used to
    /// encode each frame's payload length (1..=8).
    pub fn new(length_field_width: usize) -> Result<Self, FrameError> {
        if length_field_width == 0 || length_field_width > MAX_PREFIX_WIDTH {
            return Err(FrameError::InvalidWidth(length_field_width));
        }
        Ok(Self { length_field_width })
    }

    /// The committer's wire width for both replica streams.
    pub fn committer() -> Self {
        Self::new(8).expect("8 is a valid prefix width")
    }

    /// The legacy 4-byte width used by older test tooling.
    pub fn legacy() -> Self {
        Self::new(4).expect("4 is a valid prefix width")
    }

    /// Write the length prefix followed by `payload`, then flush.
    /// Completes only once every byte has been handed to the transport.
    pub async fn send<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = payload.len() as u64;
        let mut prefix = [0u8; MAX_PREFIX_WIDTH];
        prefix[MAX_PREFIX_WIDTH - self.length_field_width..].copy_from_slice(
            &len.to_be_bytes()[MAX_PREFIX_WIDTH - self.length_field_width..],
        );
        writer
            .write_all(&prefix[MAX_PREFIX_WIDTH - self.length_field_width..])
            .await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one frame: the length prefix, then exactly that many
    /// payload bytes. Zero-length frames are legal and return `Vec::new()`.
    pub async fn recv<R>(&self, reader: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = vec![0u8; self.length_field_width];
        read_exact_or_short(reader, &mut prefix).await?;
        let mut padded = [0u8; MAX_PREFIX_WIDTH];
        padded[MAX_PREFIX_WIDTH - self.length_field_width..].copy_from_slice(&prefix);
        let len = u64::from_be_bytes(padded) as usize;

        let mut payload = vec![0u8; len];
        read_exact_or_short(reader, &mut payload).await?;
        Ok(payload)
    }
}

async fn read_exact_or_short<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            tracing::debug!("short read: peer closed mid-frame");
            Err(FrameError::ShortRead)
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}
