//! Upload sources: real files and synthetic benchmark content.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::{Error, Result};
use crate::hash::{hash_file, hash_zeros};
use crate::storage::validate_component;
use crate::IO_BUFFER_SIZE;

/// Prefix selecting synthetic benchmark content.
pub const BENCHMARK_SCHEME: &str = "benchmark://";

/// Content to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    /// A regular file on disk
    File {
        /// Path to read from
        path: PathBuf,
        /// Object name (the file name)
        name: String,
        /// Size at the time the source was resolved
        size: u64,
    },
    /// `size` zero bytes, never materialized
    Benchmark {
        /// Object name, `<base>_<unix-nanos>`
        name: String,
        /// Content size
        size: u64,
    },
}

impl UploadSource {
    /// Resolve a source argument.
    ///
    /// `benchmark://<name>/<size>` selects synthetic content; anything else
    /// is a path to a regular file.
    ///
    /// # Errors
    ///
    /// Returns an error if the benchmark descriptor is malformed or the file
    /// cannot be inspected.
    pub async fn resolve(source: &str) -> Result<Self> {
        if let Some(spec) = source.strip_prefix(BENCHMARK_SCHEME) {
            return Self::benchmark(spec);
        }
        Self::file(Path::new(source)).await
    }

    fn benchmark(spec: &str) -> Result<Self> {
        let invalid = || {
            Error::InvalidInput(format!(
                "invalid benchmark source '{BENCHMARK_SCHEME}{spec}', use {BENCHMARK_SCHEME}<name>/<size>"
            ))
        };

        let (base, size) = spec.split_once('/').ok_or_else(invalid)?;
        if size.contains('/') {
            return Err(invalid());
        }
        validate_component("benchmark name", base)?;
        let size: u64 = size
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid benchmark size '{size}': {e}")))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();

        Ok(Self::Benchmark {
            name: format!("{base}_{nanos}"),
            size,
        })
    }

    async fn file(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        if !meta.is_file() {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a regular file",
                path.display()
            )));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidInput(format!("'{}' has no usable file name", path.display()))
            })?
            .to_string();

        Ok(Self::File {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
        })
    }

    /// Object name the content is stored under.
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Benchmark { name, .. } => name,
        }
    }

    /// Content size in bytes.
    pub const fn size(&self) -> u64 {
        match self {
            Self::File { size, .. } | Self::Benchmark { size, .. } => *size,
        }
    }

    /// Whether this is synthetic benchmark content.
    pub const fn is_benchmark(&self) -> bool {
        matches!(self, Self::Benchmark { .. })
    }

    /// Full-content hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn hash(&self) -> Result<String> {
        match self {
            Self::File { path, .. } => hash_file(path).await,
            Self::Benchmark { size, .. } => {
                let size = *size;
                tokio::task::spawn_blocking(move || hash_zeros(size, IO_BUFFER_SIZE))
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))
            }
        }
    }

    /// Open the content for sequential chunk reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(&self) -> Result<SourceReader> {
        match self {
            Self::File { path, .. } => {
                let file = File::open(path).await?;
                Ok(SourceReader::File(BufReader::with_capacity(
                    IO_BUFFER_SIZE,
                    file,
                )))
            }
            Self::Benchmark { .. } => Ok(SourceReader::Zeros),
        }
    }
}

/// Sequential reader over an upload source.
#[derive(Debug)]
pub enum SourceReader {
    /// Buffered file reader
    File(BufReader<File>),
    /// Zero-filled content
    Zeros,
}

impl SourceReader {
    /// Read exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file ends early or cannot be read.
    pub async fn read_chunk(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if let Self::File(reader) = self {
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        "source file shrank while uploading",
                    ))
                } else {
                    Error::Io(e)
                }
            })?;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    #[tokio::test]
    async fn test_resolve_benchmark() {
        let source = UploadSource::resolve("benchmark://bench/4096").await.unwrap();
        assert!(source.is_benchmark());
        assert_eq!(source.size(), 4096);

        let (base, nanos) = source.name().rsplit_once('_').unwrap();
        assert_eq!(base, "bench");
        assert!(nanos.parse::<u128>().is_ok());

        assert_eq!(source.hash().await.unwrap(), hash_bytes(&[0u8; 4096]));

        let mut reader = source.open().await.unwrap();
        assert_eq!(reader.read_chunk(3).await.unwrap(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_resolve_benchmark_rejects_malformed() {
        for bad in [
            "benchmark://nosize",
            "benchmark://a/b/3",
            "benchmark://a/-1",
            "benchmark://a/ten",
            "benchmark:///10",
        ] {
            assert!(
                matches!(UploadSource::resolve(bad).await, Err(Error::InvalidInput(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_resolve_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"ABCDEFGHI").unwrap();

        let source = UploadSource::resolve(path.to_str().unwrap()).await.unwrap();
        assert_eq!(source.name(), "notes.txt");
        assert_eq!(source.size(), 9);
        assert_eq!(source.hash().await.unwrap(), hash_bytes(b"ABCDEFGHI"));

        let mut reader = source.open().await.unwrap();
        assert_eq!(reader.read_chunk(4).await.unwrap(), b"ABCD");
        assert_eq!(reader.read_chunk(4).await.unwrap(), b"EFGH");
        assert_eq!(reader.read_chunk(1).await.unwrap(), b"I");
        assert!(reader.read_chunk(1).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            UploadSource::resolve(dir.path().join("missing").to_str().unwrap()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            UploadSource::resolve(dir.path().to_str().unwrap()).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
