//! nsqd TCP protocol V2: command encoding and frame decoding.

use std::fmt;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

pub const MSG_ID_LEN: usize = 16;
const MSG_HEADER_LEN: usize = 8 + 2 + MSG_ID_LEN;
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MSG_ID_LEN]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Publish time in nanoseconds since the epoch, as stamped by nsqd.
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Vec<u8>,
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MSG_HEADER_LEN {
            return Err(ProtocolError::ShortMessage(data.len()));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[0..8]);
        let attempts = u16::from_be_bytes([data[8], data[9]]);
        let mut id = [0u8; MSG_ID_LEN];
        id.copy_from_slice(&data[10..MSG_HEADER_LEN]);
        Ok(Message {
            id: MessageId(id),
            timestamp: i64::from_be_bytes(ts),
            attempts,
            body: data[MSG_HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(Message),
}

impl Frame {
    pub fn decode(frame_type: u32, data: Vec<u8>) -> Result<Self, ProtocolError> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
            FRAME_TYPE_MESSAGE => Message::decode(&data).map(Frame::Message),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data == HEARTBEAT)
    }
}

/// Reads one `[size][type][data]` frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let size = reader.read_u32().await? as usize;
    if size < 4 {
        return Err(ProtocolError::ShortFrame(size).into());
    }
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::OversizedFrame(size).into());
    }
    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; size - 4];
    reader.read_exact(&mut data).await?;
    Ok(Frame::decode(frame_type, data)?)
}

#[derive(Serialize, Debug, Clone)]
pub struct IdentifyBody {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    /// Milliseconds.
    pub heartbeat_interval: i64,
}

impl Default for IdentifyBody {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        IdentifyBody {
            client_id: hostname.split('.').next().unwrap_or_default().to_string(),
            hostname,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            feature_negotiation: false,
            heartbeat_interval: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Vec<u8>),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Nop,
    Cls,
}

impl Command {
    pub fn identify(body: &IdentifyBody) -> Result<Self> {
        Ok(Command::Identify(serde_json::to_vec(body)?))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Command::Identify(body) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
                buf.extend_from_slice(body);
            }
            Command::Sub { topic, channel } => {
                buf.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => buf.extend_from_slice(format!("RDY {count}\n").as_bytes()),
            Command::Fin(id) => {
                buf.extend_from_slice(b"FIN ");
                buf.extend_from_slice(&id.0);
                buf.push(b'\n');
            }
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
        }
    }
}

pub async fn write_command<W: AsyncWrite + Unpin>(writer: &mut W, cmd: &Command) -> Result<()> {
    let mut buf = Vec::with_capacity(32);
    cmd.encode(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Fails unless the next frame is the response `expected`.
pub async fn expect_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    expected: &'static str,
) -> Result<()> {
    match read_frame(reader).await? {
        Frame::Response(data) if data == expected.as_bytes() => Ok(()),
        Frame::Error(data) => {
            Err(ProtocolError::Remote(String::from_utf8_lossy(&data).into_owned()).into())
        }
        Frame::Response(data) => Err(ProtocolError::UnexpectedResponse {
            expected,
            got: String::from_utf8_lossy(&data).into_owned(),
        }
        .into()),
        Frame::Message(_) => Err(ProtocolError::UnexpectedResponse {
            expected,
            got: "<message>".to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
pub(crate) fn encode_frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
pub(crate) fn encode_message(
    id: &[u8; MSG_ID_LEN],
    timestamp: i64,
    attempts: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut data = Vec::with_capacity(MSG_HEADER_LEN + body.len());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&attempts.to_be_bytes());
    data.extend_from_slice(id);
    data.extend_from_slice(body);
    encode_frame(FRAME_TYPE_MESSAGE, &data)
}
