mod bitfield;
mod handshake;
mod request;

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

pub use bitfield::Bitfield;
pub use handshake::{HandShake, HANDSHAKE_LEN, PROTOCOL};
pub use request::*;

/// Largest frame accepted from a peer: a 16 KiB block plus headroom for
/// bitfields of very large torrents.
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    UnChoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(Request),
    Piece(Piece),
    Cancel(Cancel),
    Port(u16),
    /// A tag outside the base protocol, kept so the session can skip it.
    Unknown(u8),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("timeout")]
    Timeout,
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake error")]
    InvalidHandshake,
    #[error("message {tag} has invalid payload length {len}")]
    InvalidLength { tag: u8, len: usize },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
}

impl Message {
    /// Reads one length-prefixed message, bounding each read by `limit`.
    pub async fn from_stream<R>(stream: &mut R, limit: Duration) -> Result<Self, MessageError>
    where
        R: AsyncRead + Unpin,
    {
        let length = timeout(limit, stream.read_u32())
            .await
            .map_err(|_| MessageError::Timeout)??;
        if length > MAX_MESSAGE_LEN {
            return Err(MessageError::FrameTooLarge(length));
        }
        let mut payload = vec![0; length as usize];
        timeout(limit, stream.read_exact(&mut payload))
            .await
            .map_err(|_| MessageError::Timeout)??;
        Self::from_payload(Bytes::from(payload))
    }

    /// Reads the fixed 68-byte handshake reply.
    pub async fn read_handshake<R>(stream: &mut R, limit: Duration) -> Result<HandShake, MessageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        timeout(limit, stream.read_exact(&mut buf))
            .await
            .map_err(|_| MessageError::Timeout)??;
        HandShake::from_bytes(&buf)
    }

    pub fn from_payload(buf: Bytes) -> Result<Self, MessageError> {
        let Some(&tag) = buf.first() else {
            return Ok(Self::KeepAlive);
        };
        let body = buf.slice(1..);
        let expect_len = |len: usize| {
            if body.len() == len {
                Ok(())
            } else {
                Err(MessageError::InvalidLength {
                    tag,
                    len: body.len(),
                })
            }
        };
        let msg = match tag {
            0 => expect_len(0).map(|_| Self::Choke)?,
            1 => expect_len(0).map(|_| Self::UnChoke)?,
            2 => expect_len(0).map(|_| Self::Interested)?,
            3 => expect_len(0).map(|_| Self::NotInterested)?,
            4 => {
                expect_len(4)?;
                Self::Have(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
            }
            5 => Self::Bitfield(Bitfield::from_bytes(&body)),
            6 => Self::Request(Request::from_bytes(&body)?),
            7 => Self::Piece(Piece::from_bytes(body.clone())?),
            8 => Self::Cancel(Cancel::from_bytes(&body)?),
            9 => {
                expect_len(2)?;
                Self::Port(u16::from_be_bytes([body[0], body[1]]))
            }
            other => Self::Unknown(other),
        };
        Ok(msg)
    }

    fn id(&self) -> Option<u8> {
        let id = match self {
            Self::Choke => 0,
            Self::UnChoke => 1,
            Self::Interested => 2,
            Self::NotInterested => 3,
            Self::Have(_) => 4,
            Self::Bitfield(_) => 5,
            Self::Request(_) => 6,
            Self::Piece(_) => 7,
            Self::Cancel(_) => 8,
            Self::Port(_) => 9,
            Self::Unknown(tag) => *tag,
            Self::KeepAlive => return None,
        };
        Some(id)
    }

    /// Serialises the message including its 4-byte length prefix.
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => 0_u32.to_be_bytes().to_vec(),
            Self::Request(request) => request.as_bytes(),
            Self::Piece(piece) => piece.as_bytes(),
            Self::Cancel(cancel) => cancel.as_bytes(),
            Self::Have(index) => with_body(4, &index.to_be_bytes()),
            Self::Bitfield(bitfield) => with_body(5, bitfield.as_bytes()),
            Self::Port(port) => with_body(9, &port.to_be_bytes()),
            other => with_body(other.id().unwrap_or_default(), &[]),
        }
    }
}

fn with_body(code: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u32(1 + body.len() as u32);
    buf.put_u8(code);
    buf.put_slice(body);
    buf.to_vec()
}
