//! Length-prefixed command frames exchanged with the broker.
//!
//! Wire layout, big-endian: `seq: u32 | cmd: 7 bytes ASCII | len: u32`,
//! followed by `len` payload bytes. Command tags shorter than the field are
//! space-padded on the right.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CMD_LEN: usize = 7;
pub const HEADER_LEN: usize = 4 + CMD_LEN + 4;

/// Payload cap for CONNECT/RESET/CLOSE frames.
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;
/// Payload cap for REQUEST frames (forwarded HTTP bodies).
pub const MAX_REQUEST_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Request,
    Reset,
    Close,
}

impl Command {
    pub const fn tag(self) -> &'static [u8; CMD_LEN] {
        match self {
            Command::Connect => b"CONNECT",
            Command::Request => b"REQUEST",
            Command::Reset => b"RESET  ",
            Command::Close => b"CLOSE  ",
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"CONNECT" => Some(Command::Connect),
            b"REQUEST" => Some(Command::Request),
            b"RESET  " => Some(Command::Reset),
            b"CLOSE  " => Some(Command::Close),
            _ => None,
        }
    }

    pub fn max_payload(self) -> usize {
        match self {
            Command::Request => MAX_REQUEST_PAYLOAD,
            _ => MAX_CONTROL_PAYLOAD,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        let trimmed = std::str::from_utf8(tag).unwrap_or("?").trim_end();
        write!(f, "{trimmed}")
    }
}

/// One frame. A response frame echoes the request's `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(seq: u32, command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            command,
            payload: payload.into(),
        }
    }

    /// Zero-length frame: CONNECT ack, end-of-response terminator, plain CLOSE.
    pub fn empty(seq: u32, command: Command) -> Self {
        Self {
            seq,
            command,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Codec: unknown command tag {0:?}")]
    UnknownCommand(String),

    #[error("Codec: {command} payload length {len} exceeds cap of {max}")]
    PayloadTooLarge {
        command: Command,
        len: usize,
        max: usize,
    },

    /// The stream ended inside a frame.
    #[error("Codec: stream closed mid-frame")]
    TruncatedFrame,

    #[error("Codec: I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a frame. Pure; the inverse of [`read_frame`].
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    buf.put_u32(frame.seq);
    buf.put_slice(frame.command.tag());
    buf.put_u32(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
    buf.freeze()
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    writer.write_all(&encode(frame)).await
}

/// Read exactly one frame. `Ok(None)` means the stream ended cleanly at a
/// frame boundary; ending anywhere inside a frame is [`CodecError::TruncatedFrame`].
/// Oversize and unknown-tag headers are rejected before the payload is read.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, CodecError> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::TruncatedFrame);
        }
        filled += n;
    }

    let mut fields = &header[..];
    let seq = fields.get_u32();
    let tag = &header[4..4 + CMD_LEN];
    let command = Command::from_tag(tag)
        .ok_or_else(|| CodecError::UnknownCommand(String::from_utf8_lossy(tag).into_owned()))?;
    fields.advance(CMD_LEN);
    let len = fields.get_u32() as usize;
    if len > command.max_payload() {
        return Err(CodecError::PayloadTooLarge {
            command,
            len,
            max: command.max_payload(),
        });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CodecError::TruncatedFrame
            } else {
                CodecError::Io(e)
            }
        })?;
    }

    Ok(Some(Frame {
        seq,
        command,
        payload: payload.into(),
    }))
}
