//! Length-prefixed message framing
//!
//! Frame format:
//! - length: 4 bytes (little-endian, body size in bytes)
//! - body: `length` bytes

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::NetworkError;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Write one message
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| NetworkError::MessageTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message
///
/// Returns `Ok(None)` if the peer closed the stream cleanly between messages.
pub async fn read_message<R>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > max_size {
        return Err(NetworkError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
