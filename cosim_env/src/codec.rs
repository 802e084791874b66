//! Frame codec: 4-byte big-endian length prefix + JSON payload.
//!
//! Payload layout:
//!
//! ```text
//! Request: [0, id, [method, args, kwargs]]
//! Success: [1, id, value]
//! Failure: [2, id, "error description"]
//! ```

use crate::error::ProtocolError;
use crate::types::{Call, Message, MessageType};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encodes a message into a JSON payload (without length prefix).
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let wire = match message {
        Message::Request { id, call } => json!([
            MessageType::Request.tag(),
            id,
            [call.method, call.args, call.kwargs]
        ]),
        Message::Success { id, value } => json!([MessageType::Success.tag(), id, value]),
        Message::Failure { id, error } => json!([MessageType::Failure.tag(), id, error]),
    };
    serde_json::to_vec(&wire).map_err(|e| ProtocolError::malformed(e.to_string()))
}

/// Decodes a JSON payload (without length prefix) into a message.
pub fn decode(payload: &[u8]) -> Result<Message, ProtocolError> {
    let wire: Value = serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::malformed(format!("invalid JSON: {}", e)))?;

    let Value::Array(mut parts) = wire else {
        return Err(ProtocolError::malformed("payload is not an array"));
    };
    if parts.len() != 3 {
        return Err(ProtocolError::malformed(format!(
            "expected 3 elements, got {}",
            parts.len()
        )));
    }

    let content = parts.pop().unwrap_or(Value::Null);
    let id = parts[1]
        .as_u64()
        .ok_or_else(|| ProtocolError::malformed("message id is not an unsigned integer"))?;
    let kind = parts[0]
        .as_u64()
        .and_then(MessageType::from_tag)
        .ok_or_else(|| ProtocolError::malformed(format!("unknown message type {}", parts[0])))?;

    match kind {
        MessageType::Request => Ok(Message::Request {
            id,
            call: decode_call(content)?,
        }),
        MessageType::Success => Ok(Message::Success { id, value: content }),
        MessageType::Failure => Ok(Message::Failure {
            id,
            error: match content {
                Value::String(s) => s,
                other => other.to_string(),
            },
        }),
    }
}

fn decode_call(content: Value) -> Result<Call, ProtocolError> {
    let Value::Array(parts) = content else {
        return Err(ProtocolError::malformed("request content is not an array"));
    };
    let mut parts = parts.into_iter();

    let method = match parts.next() {
        Some(Value::String(m)) => m,
        _ => return Err(ProtocolError::malformed("request method is not a string")),
    };
    let args = match parts.next() {
        Some(Value::Array(a)) => a,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(ProtocolError::malformed("request args is not an array")),
    };
    let kwargs = match parts.next() {
        Some(Value::Object(k)) => k,
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(ProtocolError::malformed("request kwargs is not an object")),
    };
    if parts.next().is_some() {
        return Err(ProtocolError::malformed("request content has extra elements"));
    }

    Ok(Call { method, args, kwargs })
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A
/// stream ending inside the length prefix or the body is a malformed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::malformed(format!(
                "stream ended after {} of 4 length bytes",
                filled
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            ProtocolError::malformed(format!("stream ended inside a {} byte frame", len))
        }
        _ => e.into(),
    })?;
    Ok(Some(payload))
}
