// clipgen-net::codec — framing for collective messages on a byte stream.
//
// Wire format: [u32 big-endian length][bincode payload]
// Bincode keeps tensor data as length + raw little-endian floats, so a frame
// costs little more than its element bytes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};
use crate::frame::CollectiveFrame;

/// Default limit on a single frame: 1 GiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024 * 1024;

pub fn encode_frame(frame: &CollectiveFrame) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))
}

pub fn decode_frame(buf: &[u8]) -> Result<CollectiveFrame> {
    let (frame, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())
        .map_err(|e| NetError::Codec(e.to_string()))?;
    Ok(frame)
}

/// Encode and write one frame.
pub async fn write_frame<W>(io: &mut W, frame: &CollectiveFrame, max_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame)?;
    if buf.len() > max_bytes {
        return Err(NetError::FrameTooLarge { len: buf.len(), max: max_bytes });
    }
    write_length_prefixed(io, &buf).await
}

/// Read and decode one frame.
pub async fn read_frame<R>(io: &mut R, max_bytes: usize) -> Result<CollectiveFrame>
where
    R: AsyncRead + Unpin,
{
    let buf = read_length_prefixed(io, max_bytes).await?;
    decode_frame(&buf)
}

// ── Wire Helpers ──────────────────────────────────────────────────────────────

async fn read_length_prefixed<R: AsyncRead + Unpin>(io: &mut R, max_bytes: usize) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(NetError::FrameTooLarge { len, max: max_bytes });
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_length_prefixed<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload exceeds u32::MAX: {} bytes", data.len()),
        )
    })?;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameKind, FramePayload};
    use clipgen_types::Tensor;

    #[tokio::test]
    async fn tensor_frame_round_trip() {
        let t = Tensor::from_fn(&[1, 2, 3], |i| i as f32 * 0.5);
        let frame = CollectiveFrame::tensor(3, 12, FrameKind::Gather, t.clone());

        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &frame, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len + 4, buf.len());

        let decoded = read_frame(&mut buf.as_slice(), DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(decoded.from_rank, 3);
        assert_eq!(decoded.epoch, 12);
        assert_eq!(decoded.kind, FrameKind::Gather);
        assert_eq!(decoded.payload, FramePayload::Tensor(t));
    }

    #[tokio::test]
    async fn back_to_back_frames() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &CollectiveFrame::size(0, 1, 5), 1024).await.unwrap();
        write_frame(&mut buf, &CollectiveFrame::size(0, 2, 7), 1024).await.unwrap();

        let mut rest = buf.as_slice();
        assert_eq!(read_frame(&mut rest, 1024).await.unwrap().payload, FramePayload::Size(5));
        assert_eq!(read_frame(&mut rest, 1024).await.unwrap().payload, FramePayload::Size(7));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn oversized_frames_rejected() {
        let frame = CollectiveFrame::tensor(0, 0, FrameKind::Gather, Tensor::zeros(&[64]));
        assert!(matches!(
            write_frame(&mut Vec::<u8>::new(), &frame, 16).await,
            Err(NetError::FrameTooLarge { .. })
        ));

        let mut buf = (1_000_000u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            read_frame(&mut buf.as_slice(), 1024).await,
            Err(NetError::FrameTooLarge { len: 1_000_000, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_io_error() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &CollectiveFrame::size(1, 0, 9), 1024).await.unwrap();
        buf.truncate(buf.len() - 1);
        assert!(matches!(read_frame(&mut buf.as_slice(), 1024).await, Err(NetError::Io(_))));
    }
}
