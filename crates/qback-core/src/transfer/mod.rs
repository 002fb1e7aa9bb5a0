//! Client-side transfer sessions.
//!
//! This module drives the two client state machines:
//!
//! - [`UploadSession`]: metadata, admission wait, chunked send, final result
//! - [`DownloadSession`]: request, metadata, chunked receive, verification
//!
//! Both sessions run over any [`Framed`](crate::protocol::Framed) stream, race
//! every network operation against a deadline and abort the whole session on
//! the first failure. Nothing is retried once the session has started.
//!
//! Progress is published on a [`watch`] channel so a UI can render it without
//! slowing the transfer down.

pub mod download;
pub mod source;
pub mod upload;

pub use download::{DownloadOutcome, DownloadSession};
pub use source::{SourceReader, UploadSource, BENCHMARK_SCHEME};
pub use upload::{UploadOutcome, UploadSession};

use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::protocol::{CHUNK_HEADER_SIZE, DEFAULT_MAX_PAYLOAD_SIZE};

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Client to server
    Upload,
    /// Server to client
    Download,
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Resolving metadata or awaiting the server
    Preparing,
    /// Streaming chunks
    Transferring,
    /// Verifying content and awaiting the final result
    Finalizing,
    /// Transfer completed successfully
    Completed,
    /// The server refused the upload
    Rejected,
    /// Transfer failed
    Failed,
}

/// Progress information for a transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current state
    pub state: TransferState,
    /// Transfer direction
    pub direction: TransferDirection,
    /// Object name
    pub name: String,
    /// Chunks completed so far
    pub chunks_done: u64,
    /// Total number of chunks
    pub total_chunks: u64,
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Total bytes
    pub total_bytes: u64,
    /// Average speed in bytes per second
    pub speed_bps: u64,
    /// When the chunk phase started
    pub started_at: Instant,
}

impl TransferProgress {
    /// Create a new progress tracker.
    #[must_use]
    pub fn new(direction: TransferDirection, name: impl Into<String>) -> Self {
        Self {
            state: TransferState::Preparing,
            direction,
            name: name.into(),
            chunks_done: 0,
            total_chunks: 0,
            bytes_transferred: 0,
            total_bytes: 0,
            speed_bps: 0,
            started_at: Instant::now(),
        }
    }

    /// Get progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Publishes [`TransferProgress`] updates for one session.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    tx: watch::Sender<TransferProgress>,
}

impl ProgressTracker {
    pub(crate) fn new(direction: TransferDirection, name: &str) -> Self {
        let (tx, _rx) = watch::channel(TransferProgress::new(direction, name));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TransferProgress> {
        self.tx.subscribe()
    }

    pub(crate) fn start(&self, name: &str, total_bytes: u64, total_chunks: u64) {
        self.tx.send_modify(|p| {
            p.state = TransferState::Transferring;
            name.clone_into(&mut p.name);
            p.total_bytes = total_bytes;
            p.total_chunks = total_chunks;
            p.started_at = Instant::now();
        });
    }

    pub(crate) fn record_chunk(&self, bytes: u64) {
        self.tx.send_modify(|p| {
            p.chunks_done += 1;
            p.bytes_transferred += bytes;
            let elapsed = p.started_at.elapsed();
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let speed = throughput(p.bytes_transferred, elapsed) as u64;
            p.speed_bps = speed;
            tracing::debug!(
                "{}: chunk {}/{} ({:.1}%)",
                p.name,
                p.chunks_done,
                p.total_chunks,
                p.percentage()
            );
        });
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        self.tx.send_modify(|p| p.state = state);
    }
}

/// Parameters shared by upload and download sessions.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size in bytes (download: the hint sent to the server)
    pub chunk_size: usize,
    /// Deadline for each chunk send or receive
    pub chunk_timeout: Duration,
    /// Deadline for the admission reply, final result and listings
    pub response_timeout: Duration,
    /// Largest frame payload either side accepts
    pub max_message_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(crate::DEFAULT_CHUNK_TIMEOUT_SECS),
            response_timeout: Duration::from_secs(300),
            max_message_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransferConfig {
    /// Check that a chunk fits in one frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the chunk size is zero or too large.
    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size, self.max_message_size)
    }
}

/// Check that `chunk_size` is positive and a chunk frame fits in `max_message_size`.
///
/// # Errors
///
/// Returns `Error::InvalidInput` otherwise.
pub fn validate_chunk_size(chunk_size: usize, max_message_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidInput(
            "chunk size must be greater than zero".to_string(),
        ));
    }
    if chunk_size.saturating_add(CHUNK_HEADER_SIZE) > max_message_size {
        return Err(Error::InvalidInput(format!(
            "chunk size {} exceeds the maximum message size of {}",
            format_size(chunk_size as u64),
            format_size(max_message_size as u64)
        )));
    }
    Ok(())
}

/// Average throughput in bytes per second.
#[must_use]
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / secs
    }
}

/// Format a size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format a transfer speed for display.
#[must_use]
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if bytes_per_sec >= GB {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    } else if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{bytes_per_sec:.0} B/s")
    }
}
