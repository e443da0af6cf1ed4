//! Codec for encoding/decoding control messages

use crate::messages::ControlMessage;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control message codec
///
/// Messages are `[length: u32 BE][bincode payload]`. Reads consume exactly one
/// message so the bytes that follow it on the stream stay unread.
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum control message size (1MB)
    pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

    /// Read exactly one message from a stream
    pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let length = reader.read_u32().await? as usize;
        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        Ok(bincode::deserialize(&payload)?)
    }

    /// Write one message to a stream and flush it
    pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = bincode::serialize(msg)?;
        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        // One write keeps the length prefix and payload in the same frame
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}
