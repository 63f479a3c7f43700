//! Length-prefixed CBOR framing for peer connections.
//!
//! Frame format: [4-byte length (u32 big-endian)][CBOR payload]
//! Maximum frame size: 4 MiB.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};
use crate::messages::Message;

/// Maximum allowed frame payload.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Encode a message as a complete frame.
pub fn serialize_frame(message: &Message) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload)
        .map_err(|e| SyncError::InvalidMessage(format!("encode: {}", e)))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one message as a frame and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = serialize_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on clean EOF before a frame starts.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let message: Message = ciborium::from_reader(payload.as_slice())
        .map_err(|e| SyncError::InvalidMessage(format!("decode: {}", e)))?;
    message
        .validate_limits()
        .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
    Ok(Some(message))
}
