use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::BusError;

/// Maximum payload size accepted by framing helpers.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Writes one length-prefixed frame.
///
/// Header and payload go out in a single buffer so concurrent writers that
/// serialize on a lock never interleave partial frames.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), BusError> {
    let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if size > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, BusError> {
    let mut header = [0_u8; 4];
    reader.read_exact(&mut header).await?;

    let size = u32::from_be_bytes(header);
    if size > MAX_FRAME_SIZE {
        return Err(BusError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0_u8; size as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Like [`read_frame`], but maps a peer hang-up between frames to `None`.
pub async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, BusError> {
    match read_frame(reader).await {
        Ok(frame) => Ok(Some(frame)),
        Err(BusError::Io(err))
            if matches!(
                err.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
            ) =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
