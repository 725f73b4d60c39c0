//! Line-oriented framing: one complete JSON-RPC message per line.
//!
//! This is the framing used over process stdio. A blank or all-whitespace
//! line is a decode failure, not a keep-alive.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::rpc::{DecodeError, Envelope};

/// What went wrong while reading a frame.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Read the next message, or `None` at end of stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Envelope>, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(FramingError::Decode(DecodeError::BlankLine));
    }
    Ok(Some(Envelope::decode(trimmed)?))
}

/// Write one message followed by a newline, then flush.
pub async fn write_message<W>(writer: &mut W, envelope: &Envelope) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = envelope
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
