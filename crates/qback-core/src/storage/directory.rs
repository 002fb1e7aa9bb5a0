//! Persistent directory store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{is_part_file, validate_key, verify_content, Lookup, PART_SUFFIX};
use crate::error::{Error, Result};
use crate::hash::hash_file;
use crate::protocol::{FileMetadata, StoredItem};
use crate::IO_BUFFER_SIZE;

/// Objects stored as `<root>/<tag>/<name>`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Use `root` as the storage root, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Directory holding every object of `tag`.
    pub fn tag_dir(&self, tag: &str) -> PathBuf {
        self.root.join(tag)
    }

    /// Path of the object `(tag, name)`.
    pub fn object_path(&self, tag: &str, name: &str) -> PathBuf {
        self.root.join(tag).join(name)
    }

    /// Read existence and hash of a stored object.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the object cannot be read.
    pub async fn lookup(&self, tag: &str, name: &str) -> Result<Lookup> {
        validate_key(tag, name)?;
        let path = self.object_path(tag, name);

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Lookup::Present {
                hash: hash_file(&path).await?,
            }),
            Ok(_) => Err(Error::InvalidInput(format!(
                "'{tag}/{name}' exists and is not a regular file"
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Lookup::Absent),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a hidden part file for an admitted upload.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag directory or part file cannot be created.
    pub async fn create_writer(&self, meta: &FileMetadata) -> Result<PartFile> {
        validate_key(&meta.tag, &meta.name)?;
        let tag_dir = self.tag_dir(&meta.tag);
        fs::create_dir_all(&tag_dir).await?;

        let part_id = uuid::Uuid::new_v4().simple();
        let part_path = tag_dir.join(format!(".{part_id}{PART_SUFFIX}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await?;

        tracing::debug!("Opened part file {}", part_path.display());

        Ok(PartFile {
            writer: Some(BufWriter::with_capacity(IO_BUFFER_SIZE, file)),
            part_path,
            target_path: tag_dir.join(&meta.name),
            written: 0,
            finished: false,
        })
    }

    /// Open a stored object for reading, returning the file and its size.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no regular file is stored under the key.
    pub async fn open_object(&self, tag: &str, name: &str) -> Result<(File, u64)> {
        validate_key(tag, name)?;
        let path = self.object_path(tag, name);

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("{tag}/{name}")));
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(Error::NotFound(format!("{tag}/{name}")));
        }

        Ok((file, meta.len()))
    }

    /// Enumerate regular files directly under `tag`, sorted by name.
    ///
    /// Subdirectories and part files are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the tag directory does not exist.
    pub async fn list(&self, tag: &str) -> Result<Vec<StoredItem>> {
        super::validate_component("tag", tag)?;
        let tag_dir = self.tag_dir(tag);

        let mut entries = match fs::read_dir(&tag_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("folder '{tag}'")));
            }
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_part_file(&name) {
                continue;
            }

            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }

            let modified_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .and_then(|d| i64::try_from(d.as_secs()).ok())
                .unwrap_or_default();

            items.push(StoredItem {
                hash: hash_file(&entry.path()).await?,
                name,
                size: meta.len(),
                modified_time,
            });
        }

        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}

/// Hidden write target for one upload in directory mode.
///
/// The part file is removed on every path except a successful
/// [`finalize`](Self::finalize), including when the value is dropped.
#[derive(Debug)]
pub struct PartFile {
    writer: Option<BufWriter<File>>,
    part_path: PathBuf,
    target_path: PathBuf,
    written: u64,
    finished: bool,
}

impl PartFile {
    /// Append content to the part file.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("part file already closed")))?;
        writer.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes appended so far.
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Path of the part file.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Flush, sync and re-hash the part file, then rename it over the target.
    ///
    /// # Errors
    ///
    /// Returns `Error::IntegrityMismatch` if the written content does not
    /// match `meta`; the part file is deleted in that case and on any I/O
    /// error.
    pub async fn finalize(mut self, meta: &FileMetadata) -> Result<()> {
        let result = self.commit(meta).await;
        if result.is_err() {
            self.remove().await;
        }
        result
    }

    async fn commit(&mut self, meta: &FileMetadata) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }

        let hash = hash_file(&self.part_path).await?;
        verify_content(meta, self.written, &hash)?;

        fs::rename(&self.part_path, &self.target_path).await?;
        self.finished = true;

        tracing::debug!(
            "Committed {} ({} bytes)",
            self.target_path.display(),
            self.written
        );
        Ok(())
    }

    /// Close and delete the part file.
    pub async fn discard(mut self) {
        self.remove().await;
    }

    async fn remove(&mut self) {
        self.writer = None;
        match fs::remove_file(&self.part_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove part file {}: {}",
                self.part_path.display(),
                e
            ),
        }
        self.finished = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.finished {
            self.writer = None;
            let _ = std::fs::remove_file(&self.part_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    async fn store() -> (tempfile::TempDir, DirectoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::open(dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    fn part_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_part_file)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lookup_absent_and_present() {
        let (_dir, store) = store().await;
        assert_eq!(store.lookup("t", "a.txt").await.unwrap(), Lookup::Absent);

        std::fs::create_dir_all(store.tag_dir("t")).unwrap();
        std::fs::write(store.object_path("t", "a.txt"), b"hello").unwrap();

        assert_eq!(
            store.lookup("t", "a.txt").await.unwrap(),
            Lookup::Present {
                hash: hash_bytes(b"hello")
            }
        );
    }

    #[tokio::test]
    async fn test_part_file_commit() {
        let (_dir, store) = store().await;
        let meta = FileMetadata::new("t", "a.txt", 9, 4, hash_bytes(b"ABCDEFGHI"));

        let mut part = store.create_writer(&meta).await.unwrap();
        let part_path = part.part_path().to_path_buf();
        assert!(part_path.exists());
        assert!(!store.object_path("t", "a.txt").exists());

        for chunk in b"ABCDEFGHI".chunks(4) {
            part.append(chunk).await.unwrap();
        }
        part.finalize(&meta).await.unwrap();

        assert!(!part_path.exists());
        assert_eq!(
            std::fs::read(store.object_path("t", "a.txt")).unwrap(),
            b"ABCDEFGHI"
        );
    }

    #[tokio::test]
    async fn test_part_file_mismatch_leaves_target_untouched() {
        let (_dir, store) = store().await;
        std::fs::create_dir_all(store.tag_dir("t")).unwrap();
        std::fs::write(store.object_path("t", "a.txt"), b"old").unwrap();

        let meta = FileMetadata::new("t", "a.txt", 9, 4, hash_bytes(b"ABCDEFGHI"));
        let mut part = store.create_writer(&meta).await.unwrap();
        part.append(b"ABCDEFGHX").await.unwrap();

        assert!(matches!(
            part.finalize(&meta).await,
            Err(Error::IntegrityMismatch { .. })
        ));
        assert!(part_files(&store.tag_dir("t")).is_empty());
        assert_eq!(std::fs::read(store.object_path("t", "a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_part_file_removed_on_discard_and_drop() {
        let (_dir, store) = store().await;
        let meta = FileMetadata::new("t", "a.txt", 4, 4, hash_bytes(b"ABCD"));

        let mut part = store.create_writer(&meta).await.unwrap();
        part.append(b"AB").await.unwrap();
        part.discard().await;
        assert!(part_files(&store.tag_dir("t")).is_empty());

        let mut part = store.create_writer(&meta).await.unwrap();
        part.append(b"AB").await.unwrap();
        drop(part);
        assert!(part_files(&store.tag_dir("t")).is_empty());
        assert!(!store.object_path("t", "a.txt").exists());
    }

    #[tokio::test]
    async fn test_list_skips_directories_and_part_files() {
        let (_dir, store) = store().await;
        let tag_dir = store.tag_dir("t");
        std::fs::create_dir_all(tag_dir.join("nested")).unwrap();
        std::fs::write(tag_dir.join("b.bin"), b"bbbb").unwrap();
        std::fs::write(tag_dir.join("a.bin"), b"aa").unwrap();

        let meta = FileMetadata::new("t", "c.bin", 1, 1, hash_bytes(b"c"));
        let _part = store.create_writer(&meta).await.unwrap();

        let items = store.list("t").await.unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.bin", "b.bin"]);
        assert_eq!(items[0].size, 2);
        assert_eq!(items[0].hash, hash_bytes(b"aa"));
        assert!(items[1].modified_time > 0);
    }

    #[tokio::test]
    async fn test_list_shows_objects_with_part_suffix() {
        let (_dir, store) = store().await;
        let meta = FileMetadata::new("t", "notes.qback-part", 5, 5, hash_bytes(b"notes"));

        let mut part = store.create_writer(&meta).await.unwrap();
        part.append(b"notes").await.unwrap();
        part.finalize(&meta).await.unwrap();

        let items = store.list("t").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "notes.qback-part");
    }

    #[tokio::test]
    async fn test_part_file_name_independent_of_object_name() {
        let (_dir, store) = store().await;
        let name = "n".repeat(240);
        let meta = FileMetadata::new("t", &name, 3, 3, hash_bytes(b"abc"));

        let mut part = store.create_writer(&meta).await.unwrap();
        part.append(b"abc").await.unwrap();
        part.finalize(&meta).await.unwrap();

        assert_eq!(std::fs::read(store.object_path("t", &name)).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_list_missing_tag() {
        let (_dir, store) = store().await;
        assert!(matches!(store.list("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_object() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.open_object("t", "missing").await,
            Err(Error::NotFound(_))
        ));

        std::fs::create_dir_all(store.tag_dir("t")).unwrap();
        std::fs::write(store.object_path("t", "x"), b"12345").unwrap();
        let (_file, size) = store.open_object("t", "x").await.unwrap();
        assert_eq!(size, 5);

        assert!(matches!(
            store.open_object("t", "../x").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
