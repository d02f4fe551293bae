use std::{collections::BTreeMap, ops::Range};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::{
    error::{DecodeError, DecodeErrorKind},
    value::Value,
};

const MAX_DEPTH: usize = 64;
const PIECE_HASH_LEN: usize = 20;

/// The result of decoding a `.torrent` file.
#[derive(Debug, Clone)]
pub struct DecodedTorrent {
    pub root: Value,
    /// SHA-1 over the exact bytes of the top-level `info` value, if present.
    pub info_hash: Option<[u8; 20]>,
}

/// Decodes a single bencoded value. The whole input must be consumed.
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
    let mut decoder = Decoder::new(data, false);
    let value = decoder.value(0)?;
    decoder.finish()?;
    Ok(value)
}

/// Decodes a `.torrent` file.
///
/// Differs from [`decode`] in two ways: the byte span of the root
/// dictionary's `info` value is hashed as it appeared in `data`, and
/// `info.pieces` is returned as a list of 20-byte byte strings.
pub fn decode_torrent(data: &[u8]) -> Result<DecodedTorrent, DecodeError> {
    let mut decoder = Decoder::new(data, true);
    let root = decoder.value(0)?;
    decoder.finish()?;
    let info_hash = decoder
        .info_span
        .map(|span| Sha1::digest(&data[span]).into());
    Ok(DecodedTorrent { root, info_hash })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DictKind {
    Plain,
    Root,
    Info,
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    torrent: bool,
    info_span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], torrent: bool) -> Self {
        Self {
            data,
            pos: 0,
            torrent,
            info_span: None,
        }
    }

    fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError::new(self.pos, kind)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.data.len() {
            return Err(self.error(DecodeErrorKind::TrailingData));
        }
        Ok(())
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error(DecodeErrorKind::UnexpectedEof))
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let kind = if depth == 0 && self.torrent {
            DictKind::Root
        } else {
            DictKind::Plain
        };
        self.value_in(depth, kind)
    }

    fn value_in(&mut self, depth: usize, kind: DictKind) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(self.error(DecodeErrorKind::NestingTooDeep));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth, kind),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            other => Err(self.error(DecodeErrorKind::UnexpectedByte(other))),
        }
    }

    /// Advances to the next `delim` and returns the bytes skipped over.
    fn take_until(&mut self, delim: u8) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == delim)
            .ok_or_else(|| DecodeError::new(self.data.len(), DecodeErrorKind::UnexpectedEof))?;
        self.pos = start + len + 1;
        Ok(&self.data[start..start + len])
    }

    fn integer(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Integer)
            .ok_or_else(|| DecodeError::new(start, DecodeErrorKind::InvalidInteger))
    }

    fn byte_string(&mut self) -> Result<Bytes, DecodeError> {
        let start = self.pos;
        let digits = self.take_until(b':')?;
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| DecodeError::new(start, DecodeErrorKind::InvalidLength))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| DecodeError::new(self.data.len(), DecodeErrorKind::UnexpectedEof))?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn pieces(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let start = self.pos;
        if !self.peek()?.is_ascii_digit() {
            return self.value_in(depth, DictKind::Plain);
        }
        let raw = self.byte_string()?;
        if raw.len() % PIECE_HASH_LEN != 0 {
            return Err(DecodeError::new(start, DecodeErrorKind::InvalidPieces));
        }
        let hashes = (0..raw.len())
            .step_by(PIECE_HASH_LEN)
            .map(|offset| Value::Bytes(raw.slice(offset..offset + PIECE_HASH_LEN)))
            .collect();
        Ok(Value::List(hashes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, DecodeError> {
        self.pos += 1;
        let mut list = Vec::new();
        while self.peek()? != b'e' {
            list.push(self.value_in(depth + 1, DictKind::Plain)?);
        }
        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize, kind: DictKind) -> Result<Value, DecodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_start = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(self.error(DecodeErrorKind::NonStringKey));
            }
            let key = self.byte_string()?;
            let value = match (kind, key.as_ref()) {
                (DictKind::Root, b"info") => {
                    let start = self.pos;
                    let value = self.value_in(depth + 1, DictKind::Info)?;
                    self.info_span = Some(start..self.pos);
                    value
                }
                (DictKind::Info, b"pieces") => self.pieces(depth + 1)?,
                _ => self.value_in(depth + 1, DictKind::Plain)?,
            };
            if dict.insert(key, value).is_some() {
                return Err(DecodeError::new(key_start, DecodeErrorKind::DuplicateKey));
            }
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
