use thiserror::Error;

use crate::bencode::{decode_torrent, DecodeError, DecodedTorrent, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    #[error("torrent has no info dictionary to hash")]
    MissingInfoHash,
    #[error("expected {expected} piece hashes for the content length, found {found}")]
    PieceCountMismatch { expected: u64, found: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// Strongly typed view of a decoded `.torrent` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub announce: String,
    /// Announce tiers from `announce-list`, empty when the key is absent.
    pub announce_list: Vec<Vec<String>>,
    pub info_hash: [u8; 20],
    pub length: u64,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
}

impl TorrentMetadata {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let decoded = decode_torrent(bytes)?;
        Self::from_decoded(&decoded)
    }

    pub fn from_decoded(decoded: &DecodedTorrent) -> Result<Self, MetainfoError> {
        let root = &decoded.root;
        let info_hash = decoded.info_hash.ok_or(MetainfoError::MissingInfoHash)?;
        let info = root
            .get(b"info")
            .filter(|info| info.as_dict().is_some())
            .ok_or(MetainfoError::MissingField("info"))?;

        let announce = string_field(root, "announce")?;
        let announce_list = match root.get(b"announce-list") {
            Some(value) => parse_tiers(value)?,
            None => Vec::new(),
        };
        let name = string_field(info, "name")?;

        let piece_length = info
            .get(b"piece length")
            .ok_or(MetainfoError::MissingField("piece length"))?
            .as_integer()
            .and_then(|len| u32::try_from(len).ok())
            .filter(|&len| len > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))?;

        let piece_hashes = parse_piece_hashes(
            info.get(b"pieces")
                .ok_or(MetainfoError::MissingField("pieces"))?,
        )?;

        let files = match (info.get(b"length"), info.get(b"files")) {
            (Some(length), _) => vec![FileEntry {
                path: vec![name.clone()],
                length: non_negative(length, "length")?,
            }],
            (None, Some(files)) => parse_files(files)?,
            (None, None) => return Err(MetainfoError::MissingField("length")),
        };
        let length = files
            .iter()
            .try_fold(0u64, |total, file| total.checked_add(file.length))
            .ok_or(MetainfoError::InvalidField("length"))?;
        if length == 0 {
            return Err(MetainfoError::InvalidField("length"));
        }

        let expected = length.div_ceil(u64::from(piece_length));
        if expected != piece_hashes.len() as u64 {
            return Err(MetainfoError::PieceCountMismatch {
                expected,
                found: piece_hashes.len(),
            });
        }

        Ok(Self {
            announce,
            announce_list,
            info_hash,
            length,
            name,
            piece_length,
            piece_hashes,
            files,
        })
    }

    #[inline]
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`; the last piece may be shorter.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_length);
        let remaining = self.length.saturating_sub(start);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

fn string_field(dict: &Value, key: &'static str) -> Result<String, MetainfoError> {
    dict.get(key.as_bytes())
        .ok_or(MetainfoError::MissingField(key))?
        .as_str()
        .map(String::from)
        .ok_or(MetainfoError::InvalidField(key))
}

fn non_negative(value: &Value, key: &'static str) -> Result<u64, MetainfoError> {
    value
        .as_integer()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or(MetainfoError::InvalidField(key))
}

fn parse_tiers(value: &Value) -> Result<Vec<Vec<String>>, MetainfoError> {
    let invalid = || MetainfoError::InvalidField("announce-list");
    value
        .as_list()
        .ok_or_else(invalid)?
        .iter()
        .map(|tier| -> Result<Vec<String>, MetainfoError> {
            tier.as_list()
                .ok_or_else(invalid)?
                .iter()
                .map(|url| url.as_str().map(String::from).ok_or_else(invalid))
                .collect()
        })
        .collect()
}

/// Accepts both the pre-split list form and a raw byte string.
fn parse_piece_hashes(value: &Value) -> Result<Vec<[u8; 20]>, MetainfoError> {
    let invalid = || MetainfoError::InvalidField("pieces");
    match value {
        Value::List(hashes) => hashes
            .iter()
            .map(|hash| {
                hash.as_bytes()
                    .and_then(|b| <[u8; 20]>::try_from(b.as_ref()).ok())
                    .ok_or_else(invalid)
            })
            .collect(),
        Value::Bytes(raw) if raw.len() % 20 == 0 => Ok(raw
            .chunks_exact(20)
            .filter_map(|chunk| chunk.try_into().ok())
            .collect()),
        _ => Err(invalid()),
    }
}

fn parse_files(value: &Value) -> Result<Vec<FileEntry>, MetainfoError> {
    let invalid = || MetainfoError::InvalidField("files");
    value
        .as_list()
        .ok_or_else(invalid)?
        .iter()
        .map(|file| -> Result<FileEntry, MetainfoError> {
            let length = non_negative(
                file.get(b"length").ok_or(MetainfoError::MissingField("length"))?,
                "length",
            )?;
            let path = file
                .get(b"path")
                .and_then(Value::as_list)
                .ok_or(MetainfoError::MissingField("path"))?
                .iter()
                .map(|part| part.as_str().map(String::from).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FileEntry { path, length })
        })
        .collect()
}
