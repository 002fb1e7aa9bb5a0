//! Storage backends for the qback server.
//!
//! Objects are keyed by `(tag, name)`. Two backends exist:
//!
//! - [`DirectoryStore`] persists objects under `<root>/<tag>/<name>`. Writes
//!   go to a hidden part file that is renamed over the target only after the
//!   content has been verified, so the target never holds a partial object.
//! - [`MemoryStore`] keeps each upload in a per-session buffer that is hashed
//!   and dropped at finalize. It exists for throughput benchmarking and has no
//!   lookup, listing or download support.
//!
//! The backend is chosen once at server start and shared read-only across
//! sessions.

mod directory;
mod memory;

pub use directory::{DirectoryStore, PartFile};
pub use memory::{MemoryBuffer, MemoryStore, MAX_PREALLOCATION};

use crate::error::{Error, Result};
use crate::protocol::{FileMetadata, StoredItem};

/// Suffix of in-progress write targets in directory mode.
pub const PART_SUFFIX: &str = ".qback-part";

/// Whether `file_name` is an in-progress write target: `.{uuid}.qback-part`
/// with the uuid in 32-digit simple form.
pub fn is_part_file(file_name: &str) -> bool {
    file_name
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(PART_SUFFIX))
        .is_some_and(|id| id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Result of looking up an object before admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// No object is stored under the key
    Absent,
    /// An object is stored with the given content hash
    Present {
        /// Full-content hash of the stored object
        hash: String,
    },
    /// The backend has no existing-object semantics
    Unsupported,
}

/// Check that `value` is usable as a single path component.
///
/// # Errors
///
/// Returns `Error::InvalidInput` naming `kind` if the value is empty, contains
/// a separator or NUL, or is a relative component.
pub fn validate_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{kind} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(Error::InvalidInput(format!("invalid {kind} '{value}'")));
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidInput(format!(
            "{kind} '{}' must not contain path separators",
            value.escape_default()
        )));
    }
    Ok(())
}

/// Validate an object key.
///
/// # Errors
///
/// Returns `Error::InvalidInput` if either part is not a valid component, or
/// if the name collides with the part file naming scheme.
pub fn validate_key(tag: &str, name: &str) -> Result<()> {
    validate_component("tag", tag)?;
    validate_component("name", name)?;
    if is_part_file(name) {
        return Err(Error::InvalidInput(format!(
            "name '{name}' is reserved for in-progress uploads"
        )));
    }
    Ok(())
}

/// Compare received content against the declared metadata.
fn verify_content(meta: &FileMetadata, received: u64, hash: &str) -> Result<()> {
    if received != meta.size {
        return Err(Error::IntegrityMismatch {
            name: meta.name.clone(),
            reason: format!("size mismatch: expected {} bytes, got {received}", meta.size),
        });
    }
    if !hash.eq_ignore_ascii_case(&meta.hash) {
        return Err(Error::IntegrityMismatch {
            name: meta.name.clone(),
            reason: format!("hash mismatch: expected {}, got {hash}", meta.hash),
        });
    }
    Ok(())
}

/// The storage backend selected at server start.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Persistent directory store
    Directory(DirectoryStore),
    /// Transient in-memory store
    Memory(MemoryStore),
}

impl Backend {
    /// Short name used in logs.
    pub const fn mode(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::Memory(_) => "memory",
        }
    }

    /// Look up an existing object.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored object cannot be read.
    pub async fn lookup(&self, tag: &str, name: &str) -> Result<Lookup> {
        match self {
            Self::Directory(store) => store.lookup(tag, name).await,
            Self::Memory(_) => Ok(Lookup::Unsupported),
        }
    }

    /// Open a write target for an admitted upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be created.
    pub async fn create_writer(&self, meta: &FileMetadata) -> Result<StoreWriter> {
        match self {
            Self::Directory(store) => store.create_writer(meta).await.map(StoreWriter::Directory),
            Self::Memory(store) => Ok(StoreWriter::Memory(store.create_writer(meta))),
        }
    }

    /// List the objects stored under `tag`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the tag does not exist, or an error if
    /// the backend has no listing support.
    pub async fn list(&self, tag: &str) -> Result<Vec<StoredItem>> {
        match self {
            Self::Directory(store) => store.list(tag).await,
            Self::Memory(_) => Err(Error::InvalidInput(
                "listing is not supported by the memory backend".to_string(),
            )),
        }
    }
}

/// An in-progress upload target.
#[derive(Debug)]
pub enum StoreWriter {
    /// Part file in the tag directory
    Directory(PartFile),
    /// Session-owned buffer
    Memory(MemoryBuffer),
}

impl StoreWriter {
    /// Append a chunk of content.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Directory(part) => part.append(data).await,
            Self::Memory(buffer) => {
                buffer.append(data);
                Ok(())
            }
        }
    }

    /// Bytes appended so far.
    pub const fn written(&self) -> u64 {
        match self {
            Self::Directory(part) => part.written(),
            Self::Memory(buffer) => buffer.written(),
        }
    }

    /// Verify the content against `meta` and commit it.
    ///
    /// On any failure the partial artifact is removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityMismatch` if size or hash differ, or an I/O
    /// error if flushing or committing fails.
    pub async fn finalize(self, meta: &FileMetadata) -> Result<()> {
        match self {
            Self::Directory(part) => part.finalize(meta).await,
            Self::Memory(buffer) => buffer.finalize(meta),
        }
    }

    /// Drop the partial artifact.
    pub async fn discard(self) {
        match self {
            Self::Directory(part) => part.discard().await,
            Self::Memory(buffer) => drop(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("backups", "db.dump").is_ok());
        assert!(validate_key("backups", ".hidden").is_ok());

        assert!(validate_key("", "a").is_err());
        assert!(validate_key("a", "").is_err());
        assert!(validate_key("..", "a").is_err());
        assert!(validate_key("a", ".").is_err());
        assert!(validate_key("a/b", "c").is_err());
        assert!(validate_key("a", "..\\c").is_err());
        assert!(validate_key("a", "c\0").is_err());
    }

    #[test]
    fn test_part_file_names() {
        let part = format!(".{}{PART_SUFFIX}", uuid::Uuid::new_v4().simple());
        assert!(is_part_file(&part));
        assert!(validate_key("t", &part).is_err());

        assert!(!is_part_file("notes.qback-part"));
        assert!(!is_part_file(".notes.qback-part"));
        assert!(!is_part_file(".0123456789abcdef0123456789abcdeg.qback-part"));
        assert!(validate_key("t", "notes.qback-part").is_ok());
    }

    #[test]
    fn test_verify_content() {
        let hash = crate::hash::hash_bytes(b"ABCDEFGHI");
        let meta = FileMetadata::new("t", "n", 9, 4, hash.clone());

        assert!(verify_content(&meta, 9, &hash).is_ok());
        assert!(verify_content(&meta, 9, &hash.to_uppercase()).is_ok());

        match verify_content(&meta, 8, &hash) {
            Err(Error::IntegrityMismatch { reason, .. }) => assert!(reason.contains("size")),
            other => panic!("expected size mismatch, got {other:?}"),
        }
        match verify_content(&meta, 9, "00") {
            Err(Error::IntegrityMismatch { reason, .. }) => assert!(reason.contains("hash")),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_backend_guards() {
        let backend = Backend::Memory(MemoryStore::new());
        assert_eq!(backend.mode(), "memory");
        assert_eq!(backend.lookup("t", "n").await.unwrap(), Lookup::Unsupported);
        assert!(backend.list("t").await.is_err());
    }
}
