//! Streaming content hashing.
//!
//! Every object is identified on the wire by the BLAKE3-256 hash of its full
//! content, rendered as lowercase hex. The same tag is used for admission
//! decisions (is this exact content already stored?) and for end-to-end
//! validation at finalize.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::IO_BUFFER_SIZE;

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = blake3::OUT_LEN;

/// Incremental hasher over a byte stream.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
    len: u64,
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHasher")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl ContentHasher {
    /// Create an empty hasher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more content into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes have been hashed yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex digest of everything hashed so far.
    #[must_use]
    pub fn finalize_hex(&self) -> String {
        self.inner.finalize().to_hex().to_string()
    }
}

/// Hash an in-memory byte slice.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hash everything readable from `reader`, returning the digest and byte count.
///
/// # Errors
///
/// Returns an error if reading fails.
pub async fn hash_reader<R>(reader: &mut R) -> Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; IO_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok((hasher.finalize_hex(), hasher.len()))
}

/// Hash a file on disk without loading it into memory.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let (hash, _) = hash_reader(&mut file).await?;
    Ok(hash)
}

/// Hash `size` zero bytes, the synthetic content used by benchmark uploads.
///
/// The content is streamed through a reusable buffer of `block_size` bytes
/// so arbitrarily large benchmarks never materialize in memory.
#[must_use]
pub fn hash_zeros(size: u64, block_size: usize) -> String {
    let block = vec![0u8; block_size.max(1)];
    let mut hasher = ContentHasher::new();
    let mut remaining = size;

    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let n = remaining.min(block.len() as u64) as usize;
        hasher.update(&block[..n]);
        remaining -= n as u64;
    }

    hasher.finalize_hex()
}
