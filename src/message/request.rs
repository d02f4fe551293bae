use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MessageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        block_triple(6, self.index, self.begin, self.length)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, MessageError> {
        let (index, begin, length) = read_triple(6, buf)?;
        Ok(Self {
            index,
            begin,
            length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

impl Piece {
    pub fn new(index: u32, begin: u32, block: &[u8]) -> Self {
        Self {
            index,
            begin,
            block: Bytes::copy_from_slice(block),
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.block.len());
        buf.put_u32(9 + self.block.len() as u32);
        buf.put_u8(7);
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_slice(&self.block);
        buf.to_vec()
    }

    pub fn from_bytes(mut buf: Bytes) -> Result<Self, MessageError> {
        if buf.len() < 8 {
            return Err(MessageError::InvalidLength {
                tag: 7,
                len: buf.len(),
            });
        }
        let index = buf.get_u32();
        let begin = buf.get_u32();
        Ok(Self {
            index,
            begin,
            block: buf,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancel {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Cancel {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        block_triple(8, self.index, self.begin, self.length)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, MessageError> {
        let (index, begin, length) = read_triple(8, buf)?;
        Ok(Self {
            index,
            begin,
            length,
        })
    }
}

fn block_triple(tag: u8, index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u32(13);
    buf.put_u8(tag);
    buf.put_u32(index);
    buf.put_u32(begin);
    buf.put_u32(length);
    buf.to_vec()
}

fn read_triple(tag: u8, mut buf: &[u8]) -> Result<(u32, u32, u32), MessageError> {
    if buf.len() != 12 {
        return Err(MessageError::InvalidLength { tag, len: buf.len() });
    }
    Ok((buf.get_u32(), buf.get_u32(), buf.get_u32()))
}
