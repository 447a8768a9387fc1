//! Frame codec
//!
//! Wire format:
//! ```text
//! [4 bytes: length (big-endian u32)][UTF-8 JSON envelope]
//! ```

use crate::error::{EventBusError, Result};
use crate::messages::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload accepted from the bridge unless configured otherwise
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Encode an envelope into a length-prefixed frame
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    let len = u32::try_from(payload.len()).map_err(|_| EventBusError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload (without its length prefix)
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read exactly `buf.len()` bytes, looping over short reads.
///
/// EOF before the buffer is full is reported as `TransportClosed`.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(EventBusError::TransportClosed),
        Err(e) => Err(e.into()),
    }
}

/// Read the raw payload of the next frame.
///
/// A declared length above `max_len` fails with `FrameTooLarge` before any
/// payload is buffered.
pub async fn read_frame_bytes<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    read_full(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(EventBusError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;
    Ok(payload)
}

/// Read and decode the next frame.
///
/// Bytes after the declared length are left in the reader for the next frame.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Envelope>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let payload = read_frame_bytes(reader, max_len).await?;
    decode(&payload)
}

/// Encode an envelope and write it as one frame
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
