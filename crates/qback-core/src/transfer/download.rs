//! Download session (client side).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::watch;

use super::{
    ProgressTracker, TransferConfig, TransferDirection, TransferProgress, TransferState,
};
use crate::error::{Error, Result};
use crate::hash::ContentHasher;
use crate::protocol::{DownloadRequest, DownloadResponse, FileMetadata, Framed};
use crate::storage::validate_key;
use crate::IO_BUFFER_SIZE;

/// A verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Where the content was written
    pub path: PathBuf,
    /// Content bytes received
    pub bytes: u64,
    /// Time from metadata to verification
    pub elapsed: Duration,
}

/// Client half of one download.
#[derive(Debug)]
pub struct DownloadSession {
    tag: String,
    name: String,
    target: PathBuf,
    config: TransferConfig,
    progress: ProgressTracker,
}

impl DownloadSession {
    /// Create a session that writes `(tag, name)` to `<dest_root>/<tag>/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or chunk size is invalid.
    pub fn new(
        tag: impl Into<String>,
        name: impl Into<String>,
        dest_root: &Path,
        config: TransferConfig,
    ) -> Result<Self> {
        let tag = tag.into();
        let name = name.into();
        validate_key(&tag, &name)?;
        config.validate()?;

        let target = dest_root.join(&tag).join(&name);
        let progress = ProgressTracker::new(TransferDirection::Download, &name);

        Ok(Self {
            tag,
            name,
            target,
            config,
            progress,
        })
    }

    /// Local path the object is written to.
    pub fn target_path(&self) -> &Path {
        &self.target
    }

    /// Subscribe to progress updates.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Fail fast if the local target already exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if something is at the target path.
    pub async fn check_target(&self) -> Result<()> {
        match fs::symlink_metadata(&self.target).await {
            Ok(_) => Err(Error::AlreadyExists(self.target.display().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run the download over an open stream.
    ///
    /// The local file is deleted on every failure path.
    ///
    /// # Errors
    ///
    /// Returns an error if the target exists, the server reports a failure,
    /// any receive or write fails or times out, or the content does not
    /// match the declared metadata.
    pub async fn run<S>(&self, framed: &mut Framed<S>) -> Result<DownloadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(framed).await;
        self.progress.set_state(if result.is_ok() {
            TransferState::Completed
        } else {
            TransferState::Failed
        });
        result
    }

    async fn drive<S>(&self, framed: &mut Framed<S>) -> Result<DownloadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.check_target().await?;

        let request = DownloadRequest {
            tag: self.tag.clone(),
            name: self.name.clone(),
            chunk_size: i64::try_from(self.config.chunk_size).unwrap_or(i64::MAX),
        };
        framed
            .send_timeout(&request, self.config.chunk_timeout, "download request send")
            .await?;

        let meta = match framed
            .expect_timeout::<DownloadResponse>(self.config.response_timeout, "download metadata")
            .await?
        {
            DownloadResponse::Metadata(meta) => meta,
            DownloadResponse::Result(result) if !result.status => {
                return Err(Error::Remote(result.message));
            }
            DownloadResponse::Result(_) => {
                return Err(Error::Protocol(
                    "download finished before any metadata".to_string(),
                ));
            }
            DownloadResponse::Chunk(_) => {
                return Err(Error::UnexpectedMessage {
                    expected: "DownloadMetadata".to_string(),
                    actual: "DownloadChunk".to_string(),
                });
            }
        };

        tracing::info!(
            "Downloading tag={} name={} size={} chunks={} x {} hash={}",
            self.tag,
            self.name,
            meta.size,
            meta.chunk_count,
            meta.chunk_size,
            meta.hash
        );

        let mut target = DownloadTarget::create(&self.target).await?;
        let started = Instant::now();
        self.progress.start(&self.name, meta.size, meta.chunk_count);

        match self.receive(framed, &meta, &mut target).await {
            Ok(()) => {}
            Err(e) => {
                target.discard().await;
                return Err(e);
            }
        }

        self.progress.set_state(TransferState::Finalizing);
        let bytes = target.finalize(&meta).await?;

        let outcome = DownloadOutcome {
            path: self.target.clone(),
            bytes,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Download complete: {} ({} bytes in {:.2}s)",
            outcome.path.display(),
            outcome.bytes,
            outcome.elapsed.as_secs_f64()
        );
        Ok(outcome)
    }

    async fn receive<S>(
        &self,
        framed: &mut Framed<S>,
        meta: &FileMetadata,
        target: &mut DownloadTarget,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut received_chunks = 0u64;
        loop {
            let operation = format!("chunk {}/{} receive", received_chunks + 1, meta.chunk_count);
            match framed
                .recv_timeout::<DownloadResponse>(self.config.chunk_timeout, &operation)
                .await?
            {
                Some(DownloadResponse::Chunk(chunk)) => {
                    if chunk.data.is_empty() {
                        continue;
                    }
                    let len = chunk.data.len() as u64;
                    if target.received() + len > meta.size {
                        return Err(Error::IntegrityMismatch {
                            name: meta.name.clone(),
                            reason: format!(
                                "received more than the declared {} bytes",
                                meta.size
                            ),
                        });
                    }
                    target.append(&chunk.data).await?;
                    received_chunks += 1;
                    self.progress.record_chunk(len);
                }
                Some(DownloadResponse::Result(result)) if result.status => {
                    tracing::debug!("Server finished download: {}", result.message);
                    return Ok(());
                }
                Some(DownloadResponse::Result(result)) => {
                    return Err(Error::TransferFailed(result.message));
                }
                Some(DownloadResponse::Metadata(_)) => {
                    return Err(Error::UnexpectedMessage {
                        expected: "DownloadChunk".to_string(),
                        actual: "DownloadMetadata".to_string(),
                    });
                }
                None => {
                    tracing::debug!("Server closed the stream after {received_chunks} chunks");
                    return Ok(());
                }
            }
        }
    }
}

/// Local file being written by a download.
///
/// Deleted on every path except a successful [`finalize`](Self::finalize).
#[derive(Debug)]
struct DownloadTarget {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    hasher: ContentHasher,
    keep: bool,
}

impl DownloadTarget {
    async fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            writer: Some(BufWriter::with_capacity(IO_BUFFER_SIZE, file)),
            path: path.to_path_buf(),
            hasher: ContentHasher::new(),
            keep: false,
        })
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("download target already closed")))?;
        writer.write_all(data).await?;
        self.hasher.update(data);
        Ok(())
    }

    const fn received(&self) -> u64 {
        self.hasher.len()
    }

    async fn finalize(mut self, meta: &FileMetadata) -> Result<u64> {
        match self.verify(meta).await {
            Ok(bytes) => {
                self.keep = true;
                Ok(bytes)
            }
            Err(e) => {
                self.remove().await;
                Err(e)
            }
        }
    }

    async fn verify(&mut self, meta: &FileMetadata) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }

        let received = self.hasher.len();
        if received != meta.size {
            return Err(Error::IntegrityMismatch {
                name: meta.name.clone(),
                reason: format!("size mismatch: expected {} bytes, got {received}", meta.size),
            });
        }

        let hash = self.hasher.finalize_hex();
        if !hash.eq_ignore_ascii_case(&meta.hash) {
            return Err(Error::IntegrityMismatch {
                name: meta.name.clone(),
                reason: format!("hash mismatch: expected {}, got {hash}", meta.hash),
            });
        }

        Ok(received)
    }

    async fn discard(mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush().await;
        }
        self.remove().await;
    }

    async fn remove(&mut self) {
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("Failed to remove partial download {}: {}", self.path.display(), e);
            }
        }
        self.keep = true;
    }
}

impl Drop for DownloadTarget {
    fn drop(&mut self) {
        if !self.keep {
            self.writer = None;
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::protocol::{ChunkPayload, TransferResult, DEFAULT_MAX_PAYLOAD_SIZE};

    fn config(chunk_timeout: Duration) -> TransferConfig {
        TransferConfig {
            chunk_size: 4,
            chunk_timeout,
            response_timeout: Duration::from_secs(5),
            max_message_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Serve a scripted sequence of responses after reading the request.
    fn scripted_server(
        stream: tokio::io::DuplexStream,
        responses: Vec<DownloadResponse>,
        hold_open: bool,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, DEFAULT_MAX_PAYLOAD_SIZE);
            let _request: Option<DownloadRequest> = framed.recv().await.unwrap();
            for response in responses {
                framed.send(&response).await.unwrap();
            }
            if hold_open {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        })
    }

    fn letters_meta() -> FileMetadata {
        FileMetadata::new("t", "letters", 9, 4, hash_bytes(b"ABCDEFGHI"))
    }

    fn chunk(sequence: u64, data: &[u8]) -> DownloadResponse {
        DownloadResponse::Chunk(ChunkPayload {
            sequence,
            data: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_download_success() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![
                DownloadResponse::Metadata(letters_meta()),
                chunk(1, b"ABCD"),
                chunk(2, b"EFGH"),
                chunk(3, b"I"),
                DownloadResponse::Result(TransferResult::success("download complete")),
            ],
            false,
        );

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let outcome = session.run(&mut framed).await.unwrap();
        server.await.unwrap();

        assert_eq!(outcome.bytes, 9);
        assert_eq!(outcome.path, dir.path().join("t").join("letters"));
        assert_eq!(std::fs::read(&outcome.path).unwrap(), b"ABCDEFGHI");
        assert_eq!(session.progress().borrow().state, TransferState::Completed);
    }

    #[tokio::test]
    async fn test_download_clean_eof_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![
                DownloadResponse::Metadata(letters_meta()),
                chunk(1, b"ABCD"),
                chunk(2, b"EFGH"),
                chunk(3, b"I"),
            ],
            false,
        );

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let outcome = session.run(&mut framed).await.unwrap();
        server.await.unwrap();
        assert_eq!(outcome.bytes, 9);
    }

    #[tokio::test]
    async fn test_download_hash_mismatch_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![
                DownloadResponse::Metadata(letters_meta()),
                chunk(1, b"ABCD"),
                chunk(2, b"EFGX"),
                chunk(3, b"I"),
                DownloadResponse::Result(TransferResult::success("download complete")),
            ],
            false,
        );

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let result = session.run(&mut framed).await;
        server.await.unwrap();

        assert!(matches!(result, Err(Error::IntegrityMismatch { .. })));
        assert!(!session.target_path().exists());
    }

    #[tokio::test]
    async fn test_download_oversize_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![
                DownloadResponse::Metadata(letters_meta()),
                chunk(1, b"ABCD"),
                chunk(2, b"EFGH"),
                chunk(3, b"IJKL"),
            ],
            true,
        );

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let result = tokio::time::timeout(Duration::from_secs(2), session.run(&mut framed))
            .await
            .unwrap();
        server.abort();

        match result {
            Err(Error::IntegrityMismatch { reason, .. }) => {
                assert!(reason.contains("declared 9 bytes"), "{reason}");
            }
            other => panic!("expected integrity mismatch, got {other:?}"),
        }
        assert!(!session.target_path().exists());
    }

    #[tokio::test]
    async fn test_download_stall_times_out_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![DownloadResponse::Metadata(letters_meta()), chunk(1, b"ABCD")],
            true,
        );

        let session = DownloadSession::new(
            "t",
            "letters",
            dir.path(),
            config(Duration::from_millis(100)),
        )
        .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let result = session.run(&mut framed).await;
        server.abort();

        match result {
            Err(Error::Timeout { operation, .. }) => assert_eq!(operation, "chunk 2/3 receive"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!session.target_path().exists());
        assert_eq!(session.progress().borrow().state, TransferState::Failed);
    }

    #[tokio::test]
    async fn test_download_remote_failure_before_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = scripted_server(
            server,
            vec![DownloadResponse::Result(TransferResult::failure(
                "file does not exist",
            ))],
            false,
        );

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        let result = session.run(&mut framed).await;
        server.await.unwrap();

        match result {
            Err(Error::Remote(message)) => assert_eq!(message, "file does not exist"),
            other => panic!("expected remote error, got {other:?}"),
        }
        assert!(!dir.path().join("t").join("letters").exists());
    }

    #[tokio::test]
    async fn test_download_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("t")).unwrap();
        std::fs::write(dir.path().join("t").join("letters"), b"keep me").unwrap();

        let session =
            DownloadSession::new("t", "letters", dir.path(), config(Duration::from_secs(5)))
                .unwrap();
        assert!(matches!(
            session.check_target().await,
            Err(Error::AlreadyExists(_))
        ));

        let (client, _server) = tokio::io::duplex(1024);
        let mut framed = Framed::new(client, DEFAULT_MAX_PAYLOAD_SIZE);
        assert!(matches!(
            session.run(&mut framed).await,
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(
            std::fs::read(dir.path().join("t").join("letters")).unwrap(),
            b"keep me"
        );
    }
}
