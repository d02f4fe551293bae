use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

/// Destination for verified pieces.
///
/// `store` may be called more than once for the same index across retries and
/// must leave the same result as a single call.
pub trait PieceSink: Send + Sync {
    fn store(&self, index: u32, data: &[u8]) -> io::Result<()>;
}

/// Keeps pieces in memory, keyed by index.
#[derive(Debug, Default)]
pub struct MemorySink {
    pieces: Mutex<BTreeMap<u32, Vec<u8>>>,
    calls: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn piece(&self, index: u32) -> Option<Vec<u8>> {
        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    /// Concatenation of all stored pieces in index order.
    pub fn assemble(&self) -> Vec<u8> {
        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .copied()
            .collect()
    }

    pub fn store_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PieceSink for MemorySink {
    fn store(&self, index: u32, data: &[u8]) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pieces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index, data.to_vec());
        Ok(())
    }
}

/// Writes each piece at `index * piece_length` in a single output file.
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
    piece_length: u64,
}

impl FileSink {
    /// Creates (or truncates) `path` and sizes it to `length` bytes.
    pub fn create<P: AsRef<Path>>(path: P, length: u64, piece_length: u32) -> io::Result<Self> {
        if let Some(dir) = path.as_ref().parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        file.set_len(length)?;
        Ok(Self {
            file: Mutex::new(file),
            piece_length: u64::from(piece_length),
        })
    }
}

impl PieceSink for FileSink {
    fn store(&self, index: u32, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(u64::from(index) * self.piece_length))?;
        file.write_all(data)?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_overwrites_idempotently() {
        let sink = MemorySink::new();
        sink.store(1, b"bb").unwrap();
        sink.store(0, b"aa").unwrap();
        sink.store(1, b"bb").unwrap();
        assert_eq!(sink.store_calls(), 3);
        assert_eq!(sink.piece(1), Some(b"bb".to_vec()));
        assert_eq!(sink.assemble(), b"aabb");
    }

    #[test]
    fn file_sink_writes_at_piece_offsets() {
        let path = std::env::temp_dir().join(format!("bitleech-sink-{}", std::process::id()));
        let sink = FileSink::create(&path, 10, 4).unwrap();
        sink.store(2, b"zz").unwrap();
        sink.store(0, b"aaaa").unwrap();
        sink.store(1, b"bbbb").unwrap();
        sink.store(1, b"bbbb").unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), b"aaaabbbbzz");
        std::fs::remove_file(&path).unwrap();
    }
}
