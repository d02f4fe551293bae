use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::message::Request;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("piece #{index} has a wrong hash, expected: {expected:x?}, found: {found:x?}")]
pub struct VerificationError {
    pub index: u32,
    pub expected: [u8; 20],
    pub found: [u8; 20],
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("block (begin {begin}, length {length}) does not fit piece #{index}")]
pub struct BlockError {
    pub index: u32,
    pub begin: u32,
    pub length: usize,
}

/// Assembly buffer for one in-progress piece.
///
/// Blocks are `block_size` aligned; the last block of the piece may be short.
#[derive(Debug)]
pub struct PieceBuffer {
    index: u32,
    data: Vec<u8>,
    block_size: u32,
    received: Vec<bool>,
    missing: usize,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u32, block_size: u32) -> Self {
        let blocks = length.div_ceil(block_size) as usize;
        Self {
            index,
            data: vec![0; length as usize],
            block_size,
            received: vec![false; blocks],
            missing: blocks,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block as u32 * self.block_size;
        self.block_size.min(self.len() - begin)
    }

    /// The first block not yet received.
    pub fn next_request(&self) -> Option<Request> {
        let block = self.received.iter().position(|&got| !got)?;
        Some(Request::new(
            self.index,
            block as u32 * self.block_size,
            self.block_len(block),
        ))
    }

    /// Copies a block in at `begin`. A repeated block is accepted and ignored.
    pub fn put_block(&mut self, begin: u32, block: &[u8]) -> Result<(), BlockError> {
        let err = || BlockError {
            index: self.index,
            begin,
            length: block.len(),
        };
        if begin % self.block_size != 0 {
            return Err(err());
        }
        let slot = (begin / self.block_size) as usize;
        if slot >= self.received.len() || block.len() != self.block_len(slot) as usize {
            return Err(err());
        }
        if self.received[slot] {
            return Ok(());
        }
        let start = begin as usize;
        self.data[start..start + block.len()].copy_from_slice(block);
        self.received[slot] = true;
        self.missing -= 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    pub fn verify(&self, expected: &[u8; 20]) -> Result<(), VerificationError> {
        let found: [u8; 20] = Sha1::digest(&self.data).into();
        if found != *expected {
            return Err(VerificationError {
                index: self.index,
                expected: *expected,
                found,
            });
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
