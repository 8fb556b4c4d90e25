//! Transport framing module
//!
//! The channel speaks a plain length-prefixed TCP protocol: every frame is a
//! `u16` little-endian payload length followed by the payload. No encryption
//! is applied. Reading and writing are split so the writer half can live in
//! its own task.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{FieldServerError, NetworkError, Result};
use crate::net::buffer::MAX_PACKET_SIZE;

/// Size of the frame length header
pub const FRAME_HEADER_SIZE: usize = 2;

/// Read chunk size
const READ_CHUNK_SIZE: usize = 8192;

/// Buffered reader that yields whole frames
pub struct FrameReader<R> {
    inner: R,
    read_buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            read_buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn buffered_len(&self) -> usize {
        self.read_buffer.len()
    }

    /// Read the next frame's payload
    ///
    /// Fails with `ConnectionClosed` when the peer closes the stream, even in
    /// the middle of a frame.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        self.fill(FRAME_HEADER_SIZE).await?;
        let length = u16::from_le_bytes([self.read_buffer[0], self.read_buffer[1]]) as usize;

        self.fill(FRAME_HEADER_SIZE + length).await?;
        let _ = self.read_buffer.split_to(FRAME_HEADER_SIZE);
        let payload = self.read_buffer.split_to(length).freeze();

        trace!(length = length, "Read frame");
        Ok(payload)
    }

    async fn fill(&mut self, needed: usize) -> Result<()> {
        while self.read_buffer.len() < needed {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let bytes_read = self.inner.read(&mut chunk).await?;
            if bytes_read == 0 {
                return Err(FieldServerError::Network(NetworkError::ConnectionClosed));
            }
            self.read_buffer.extend_from_slice(&chunk[..bytes_read]);
        }
        Ok(())
    }
}

/// Write one frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PACKET_SIZE {
        return Err(FieldServerError::Network(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PACKET_SIZE,
        }));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
