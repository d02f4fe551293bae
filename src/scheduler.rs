use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    net::SocketAddrV4,
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::{debug, warn};

use crate::{
    message::{Bitfield, Request},
    metainfo::TorrentMetadata,
    piece::{BlockError, PieceBuffer},
};

/// Work queue shared by every peer session of one download.
///
/// Each piece index is always in exactly one of three places: the queue, a
/// single session's claim (with a [`PieceBuffer`] in `buffers`), or the
/// completed set. Sessions must hand unfinished claims back via [`release`].
///
/// [`release`]: PieceScheduler::release
#[derive(Debug)]
pub struct PieceScheduler {
    piece_count: u32,
    piece_length: u32,
    total_length: u64,
    block_size: u32,
    queue: Mutex<VecDeque<u32>>,
    completed: Mutex<BTreeSet<u32>>,
    buffers: Mutex<HashMap<u32, PieceBuffer>>,
    failed_peers: Mutex<HashSet<SocketAddrV4>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PieceScheduler {
    pub fn new(piece_count: u32, piece_length: u32, total_length: u64, block_size: u32) -> Self {
        Self {
            piece_count,
            piece_length,
            total_length,
            block_size,
            queue: Mutex::new((0..piece_count).collect()),
            completed: Mutex::new(BTreeSet::new()),
            buffers: Mutex::new(HashMap::new()),
            failed_peers: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_metadata(metadata: &TorrentMetadata, block_size: u32) -> Self {
        Self::new(
            metadata.piece_count(),
            metadata.piece_length,
            metadata.length,
            block_size,
        )
    }

    fn piece_len(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_length);
        self.total_length
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    /// Claims the first queued index the peer holds.
    ///
    /// Ineligible indices are rotated to the tail; at most one full pass is
    /// made. The whole scan runs under the queue lock so two sessions never
    /// claim the same index.
    pub fn claim_next(&self, bitfield: &Bitfield) -> Option<u32> {
        let index = {
            let mut queue = lock(&self.queue);
            let mut found = None;
            for _ in 0..queue.len() {
                let Some(index) = queue.pop_front() else {
                    break;
                };
                if bitfield.has_piece(index) {
                    found = Some(index);
                    break;
                }
                queue.push_back(index);
            }
            found?
        };
        lock(&self.buffers).insert(
            index,
            PieceBuffer::new(index, self.piece_len(index), self.block_size),
        );
        Some(index)
    }

    /// Returns a claimed index to the tail of the queue and drops its buffer.
    pub fn release(&self, index: u32) {
        lock(&self.buffers).remove(&index);
        if lock(&self.completed).contains(&index) {
            return;
        }
        let mut queue = lock(&self.queue);
        if queue.contains(&index) {
            warn!("piece #{} released twice", index);
            return;
        }
        debug!("piece #{} returned to queue", index);
        queue.push_back(index);
    }

    /// Next block to request for a claimed piece.
    pub fn next_request(&self, index: u32) -> Option<Request> {
        lock(&self.buffers).get(&index)?.next_request()
    }

    /// Stores a block; returns whether the piece is now fully populated.
    pub fn put_block(&self, index: u32, begin: u32, block: &[u8]) -> Result<bool, BlockError> {
        let mut buffers = lock(&self.buffers);
        let buffer = buffers.get_mut(&index).ok_or(BlockError {
            index,
            begin,
            length: block.len(),
        })?;
        buffer.put_block(begin, block)?;
        Ok(buffer.is_complete())
    }

    /// Removes the buffer of a fully populated piece for verification.
    pub fn take_buffer(&self, index: u32) -> Option<PieceBuffer> {
        lock(&self.buffers).remove(&index)
    }

    /// Marks a verified piece complete. Returns `false` if it already was.
    pub fn complete(&self, index: u32) -> bool {
        lock(&self.buffers).remove(&index);
        lock(&self.completed).insert(index)
    }

    pub fn mark_failed(&self, peer: SocketAddrV4) {
        lock(&self.failed_peers).insert(peer);
    }

    /// Drains the failed-peer set.
    pub fn take_failed(&self) -> Vec<SocketAddrV4> {
        let mut peers: Vec<_> = lock(&self.failed_peers).drain().collect();
        peers.sort();
        peers
    }

    pub fn is_failed(&self, peer: &SocketAddrV4) -> bool {
        lock(&self.failed_peers).contains(peer)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn completed_count(&self) -> u32 {
        lock(&self.completed).len() as u32
    }

    pub fn is_completed(&self, index: u32) -> bool {
        lock(&self.completed).contains(&index)
    }

    pub fn completed_pieces(&self) -> Vec<u32> {
        lock(&self.completed).iter().copied().collect()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.buffers).len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.piece_count
    }
}
