//! Upload session (client side).

use std::fmt;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use super::{
    format_size, format_speed, throughput, ProgressTracker, TransferConfig, TransferDirection,
    TransferProgress, TransferState, UploadSource,
};
use crate::error::{Error, Result};
use crate::protocol::{ChunkPayload, FileMetadata, Framed, UploadRequest, UploadResponse};
use crate::storage::validate_component;

/// Outcome of an upload that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server refused the upload at admission
    Rejected {
        /// Server's reason
        message: String,
    },
    /// The server stored the object
    Completed {
        /// Stored object name
        name: String,
        /// Server's confirmation
        message: String,
        /// Content bytes sent
        bytes: u64,
        /// Time spent streaming chunks and awaiting the result
        elapsed: Duration,
    },
}

impl UploadOutcome {
    /// Whether the object was stored.
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Average throughput of a completed upload in bytes per second.
    pub fn throughput(&self) -> Option<f64> {
        match self {
            Self::Completed { bytes, elapsed, .. } => Some(throughput(*bytes, *elapsed)),
            Self::Rejected { .. } => None,
        }
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { message } => write!(f, "upload rejected: {message}"),
            Self::Completed {
                name,
                message,
                bytes,
                elapsed,
            } => write!(
                f,
                "{message}: {name} ({}) in {:.2}s, {}",
                format_size(*bytes),
                elapsed.as_secs_f64(),
                format_speed(throughput(*bytes, *elapsed))
            ),
        }
    }
}

/// Client half of one upload.
///
/// Created with [`prepare`](Self::prepare), which hashes the content before
/// any connection exists, then driven once with [`run`](Self::run).
#[derive(Debug)]
pub struct UploadSession {
    source: UploadSource,
    metadata: FileMetadata,
    config: TransferConfig,
    progress: ProgressTracker,
}

impl UploadSession {
    /// Resolve size and hash of `source` and build the upload metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag or chunk size is invalid or the content
    /// cannot be hashed.
    pub async fn prepare(tag: &str, source: UploadSource, config: TransferConfig) -> Result<Self> {
        validate_component("tag", tag)?;
        validate_component("name", source.name())?;
        config.validate()?;

        let progress = ProgressTracker::new(TransferDirection::Upload, source.name());
        let hash = source.hash().await?;
        let metadata = FileMetadata::new(
            tag,
            source.name(),
            source.size(),
            config.chunk_size as u64,
            hash,
        );

        tracing::info!(
            "Prepared {} upload tag={} name={} size={} chunks={} x {} hash={}",
            if source.is_benchmark() { "benchmark" } else { "file" },
            metadata.tag,
            metadata.name,
            metadata.size,
            metadata.chunk_count,
            metadata.chunk_size,
            metadata.hash
        );

        Ok(Self {
            source,
            metadata,
            config,
            progress,
        })
    }

    /// Metadata sent to the server.
    pub const fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Subscribe to progress updates.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Run the upload over an open stream.
    ///
    /// # Errors
    ///
    /// Returns an error if any send or receive fails or times out, or the
    /// server reports a failed transfer. A rejection at admission is an
    /// `Ok(UploadOutcome::Rejected)`.
    pub async fn run<S>(&self, framed: &mut Framed<S>) -> Result<UploadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.drive(framed).await;
        self.progress.set_state(match &result {
            Ok(UploadOutcome::Completed { .. }) => TransferState::Completed,
            Ok(UploadOutcome::Rejected { .. }) => TransferState::Rejected,
            Err(_) => TransferState::Failed,
        });
        result
    }

    async fn drive<S>(&self, framed: &mut Framed<S>) -> Result<UploadOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let meta = &self.metadata;
        let chunk_timeout = self.config.chunk_timeout;
        let response_timeout = self.config.response_timeout;

        framed
            .send_timeout(
                &UploadRequest::Metadata(meta.clone()),
                chunk_timeout,
                "metadata send",
            )
            .await?;

        let ack = match framed
            .expect_timeout::<UploadResponse>(response_timeout, "admission reply")
            .await?
        {
            UploadResponse::MetaAck(ack) if ack.allow => ack,
            UploadResponse::MetaAck(ack) => {
                tracing::info!("Server rejected upload of {}: {}", meta.name, ack.message);
                return Ok(UploadOutcome::Rejected {
                    message: ack.message,
                });
            }
            UploadResponse::Result(result) => {
                tracing::info!("Server refused upload of {}: {}", meta.name, result.message);
                return Ok(UploadOutcome::Rejected {
                    message: result.message,
                });
            }
        };
        tracing::debug!("Server admitted upload: {}", ack.message);

        let mut reader = self.source.open().await?;
        let started = Instant::now();
        let mut sent = 0u64;
        self.progress.start(&meta.name, meta.size, meta.chunk_count);

        for sequence in 1..=meta.chunk_count {
            let Some((_, len)) = meta.chunk_bounds(sequence) else {
                break;
            };
            #[allow(clippy::cast_possible_truncation)]
            let data = reader.read_chunk(len as usize).await?;

            framed
                .send_timeout(
                    &UploadRequest::Chunk(ChunkPayload { sequence, data }),
                    chunk_timeout,
                    &format!("chunk {sequence}/{} send", meta.chunk_count),
                )
                .await?;

            sent += len;
            self.progress.record_chunk(len);
        }

        self.progress.set_state(TransferState::Finalizing);
        framed
            .send_timeout(&UploadRequest::End, chunk_timeout, "end of upload")
            .await?;

        match framed
            .expect_timeout::<UploadResponse>(response_timeout, "upload result")
            .await?
        {
            UploadResponse::Result(result) if result.status => {
                let outcome = UploadOutcome::Completed {
                    name: meta.name.clone(),
                    message: result.message,
                    bytes: sent,
                    elapsed: started.elapsed(),
                };
                tracing::info!("Upload finished: {outcome}");
                Ok(outcome)
            }
            UploadResponse::Result(result) => Err(Error::TransferFailed(result.message)),
            UploadResponse::MetaAck(_) => Err(Error::UnexpectedMessage {
                expected: "TransferResult".to_string(),
                actual: "MetaAck".to_string(),
            }),
        }
    }
}
