//! Multipart message framing over a byte stream.
//!
//! A message is one or more frames. Each frame is
//! `flags: u8 || len: u32 BE || body`; bit 0 of `flags` is set on every frame
//! except the last one of a message.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Largest accepted number of frames in one message.
pub const MAX_FRAMES: usize = 16;

const FLAG_MORE: u8 = 0x01;
const HEADER_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(usize),

    #[error("message has more than {MAX_FRAMES} frames")]
    TooManyFrames,

    #[error("cannot send a message with no frames")]
    Empty,

    #[error("stream ended in the middle of a message")]
    Truncated,
}

/// Write one message made of `frames` and flush.
pub async fn write_message<W>(writer: &mut W, frames: &[Bytes]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() {
        return Err(FrameError::Empty);
    }
    if frames.len() > MAX_FRAMES {
        return Err(FrameError::TooManyFrames);
    }

    let total: usize = frames.iter().map(|f| HEADER_LEN + f.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    let last = frames.len() - 1;

    for (i, frame) in frames.iter().enumerate() {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(frame.len()));
        }
        buf.put_u8(if i < last { FLAG_MORE } else { 0 });
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` when the stream ends cleanly
/// between two messages.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<Bytes>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = Vec::new();

    loop {
        let flags = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return if frames.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameError::Truncated)
                };
            }
            Err(e) => return Err(e.into()),
        };

        let len = reader.read_u32().await.map_err(truncated)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(truncated)?;
        frames.push(Bytes::from(body));

        if flags & FLAG_MORE == 0 {
            return Ok(Some(frames));
        }
        if frames.len() >= MAX_FRAMES {
            return Err(FrameError::TooManyFrames);
        }
    }
}

fn truncated(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}
