//! Transient in-memory store used for benchmarking.

use super::verify_content;
use crate::error::Result;
use crate::hash::hash_bytes;
use crate::protocol::FileMetadata;

/// Upper bound on the buffer reserved up front for one upload (64 MB).
pub const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Memory backend. Holds no state of its own; every upload owns its buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStore;

impl MemoryStore {
    /// Create the memory backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Allocate a buffer for an admitted upload.
    #[must_use]
    pub fn create_writer(&self, meta: &FileMetadata) -> MemoryBuffer {
        let reserve = usize::try_from(meta.size)
            .unwrap_or(MAX_PREALLOCATION)
            .min(MAX_PREALLOCATION);
        MemoryBuffer {
            data: Vec::with_capacity(reserve),
        }
    }
}

/// Content of one upload held in memory.
#[derive(Debug)]
pub struct MemoryBuffer {
    data: Vec<u8>,
}

impl MemoryBuffer {
    /// Append a chunk.
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Bytes held so far.
    pub const fn written(&self) -> u64 {
        self.data.len() as u64
    }

    /// Hash the buffer, compare it to `meta`, then drop it.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityMismatch` on size or hash mismatch.
    pub fn finalize(self, meta: &FileMetadata) -> Result<()> {
        let hash = hash_bytes(&self.data);
        verify_content(meta, self.written(), &hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_buffer_finalize() {
        let content = b"ABCDEFGHI";
        let meta = FileMetadata::new("bench", "n", 9, 4, hash_bytes(content));

        let mut buffer = MemoryStore::new().create_writer(&meta);
        for chunk in content.chunks(4) {
            buffer.append(chunk);
        }
        assert_eq!(buffer.written(), 9);
        assert!(buffer.finalize(&meta).is_ok());
    }

    #[test]
    fn test_buffer_finalize_detects_truncation() {
        let meta = FileMetadata::new("bench", "n", 9, 4, hash_bytes(b"ABCDEFGHI"));

        let mut buffer = MemoryStore::new().create_writer(&meta);
        buffer.append(b"ABCD");
        assert!(matches!(
            buffer.finalize(&meta),
            Err(Error::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_preallocation_is_capped() {
        let meta = FileMetadata::new("bench", "huge", u64::MAX, 1024, "h");
        let buffer = MemoryStore::new().create_writer(&meta);
        assert!(buffer.data.capacity() <= MAX_PREALLOCATION * 2);
        assert_eq!(buffer.written(), 0);
    }
}
