//! Bencode codec.
//!
//! [`decode`] turns raw bytes into a [`Value`] tree. [`decode_torrent`] does
//! the same for `.torrent` files and additionally hashes the `info`
//! dictionary over its original byte span, and splits `info.pieces` into
//! 20-byte piece hashes.

mod decode;
mod error;
mod value;

pub use decode::{decode, decode_torrent, DecodedTorrent};
pub use error::{DecodeError, DecodeErrorKind};
pub use value::Value;

/// Encodes a value. Dictionary keys are written in sorted byte order.
pub fn encode(value: &Value) -> Result<Vec<u8>, serde_bencode::Error> {
    serde_bencode::to_bytes(value)
}
