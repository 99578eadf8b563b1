//! Transport frames: 4-byte big-endian length prefix + bincode body.

use idnet_protocol::version::MAX_PAYLOAD_SIZE;
use idnet_types::{MsgId, NodeId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Maximum frame body size: a full payload plus envelope overhead.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 64 * 1024;

/// One sealed message in transit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFrame {
    pub sender: NodeId,
    pub msg_id: MsgId,
    /// A bincode-encoded `EncryptedEnvelope`.
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMessage {
    Data(WireFrame),
    Ack { msg_id: MsgId },
    Refused { msg_id: MsgId, reason: String },
}

pub async fn write_frame<W>(writer: &mut W, message: &TransportMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<TransportMessage>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}
