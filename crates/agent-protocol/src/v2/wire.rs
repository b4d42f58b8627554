//! v2 wire codec: length + type-tag framing.
//!
//! Frame layout: `[4-byte BE length][1-byte tag][length-1 bytes of JSON]`.
//! `length` includes the tag byte. Size limits are enforced by the caller,
//! which knows whether the connection is UDS (16 MiB - 1) or the
//! gRPC-simulated TCP transport (10 MiB).

use crate::errors::AgentProtocolError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Recognised v2 message type tags. Unknown tags are not represented here;
/// the caller reads the raw byte and decides whether to treat it as unknown
/// (log + skip) rather than terminate the connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    HandshakeReq = 0x01,
    HandshakeResp = 0x02,
    RequestHeaders = 0x10,
    RequestBodyChunk = 0x11,
    ResponseHeaders = 0x12,
    ResponseBodyChunk = 0x13,
    Decision = 0x20,
    /// Reserved: a standalone body-mutation frame. The reference dispatcher
    /// never emits this tag (mutations travel inside `Decision`), but a
    /// conforming reader must still recognise it as known.
    BodyMutation = 0x21,
    CancelRequest = 0x30,
    CancelAll = 0x31,
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::HandshakeReq),
            0x02 => Ok(MessageType::HandshakeResp),
            0x10 => Ok(MessageType::RequestHeaders),
            0x11 => Ok(MessageType::RequestBodyChunk),
            0x12 => Ok(MessageType::ResponseHeaders),
            0x13 => Ok(MessageType::ResponseBodyChunk),
            0x20 => Ok(MessageType::Decision),
            0x21 => Ok(MessageType::BodyMutation),
            0x30 => Ok(MessageType::CancelRequest),
            0x31 => Ok(MessageType::CancelAll),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            other => Err(other),
        }
    }
}

/// Write one frame. `payload` is the JSON body (without the tag byte).
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
    max_payload: usize,
) -> Result<(), AgentProtocolError> {
    if payload.len() > max_payload {
        return Err(AgentProtocolError::MessageTooLarge {
            size: payload.len(),
            max: max_payload,
        });
    }
    let total_len = (payload.len() + 1) as u32;
    writer.write_all(&total_len.to_be_bytes()).await?;
    writer.write_all(&[msg_type as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, returning the raw type tag (not yet validated as known)
/// and the JSON payload bytes.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<(u8, Vec<u8>), AgentProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(AgentProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let total_len = u32::from_be_bytes(len_bytes) as usize;
    if total_len == 0 {
        return Err(AgentProtocolError::InvalidMessage("zero-length frame".to_string()));
    }
    // total_len includes the tag byte; compare the payload portion to the cap.
    if total_len - 1 > max_payload {
        return Err(AgentProtocolError::MessageTooLarge {
            size: total_len - 1,
            max: max_payload,
        });
    }

    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag).await?;

    let payload_len = total_len - 1;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((tag[0], payload))
}
