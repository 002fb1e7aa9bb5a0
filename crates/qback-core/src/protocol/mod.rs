//! QBAK wire protocol implementation.
//!
//! qback uses a lightweight binary framing over TCP (optionally wrapped in
//! mutual TLS). Each logical message is exactly one frame.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      QBAK Frame                            │
//! ├────────────┬────────────┬────────────┬─────────────────────┤
//! │   Magic    │  Version   │    Type    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │      4 bytes        │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! │                    (variable length)                       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x51 0x42 0x41 0x4B` ("QBAK")
//! - Version: `0x01 0x00` (1.0)
//! - Type: Message type byte
//! - Length: Payload length in bytes (big-endian)
//!
//! Control payloads are JSON. Chunk payloads are binary:
//! `sequence (8 bytes, big-endian) | data`.
//!
//! ## Sessions
//!
//! The first frame on a connection selects the session:
//!
//! ```text
//! Ping             -> Pong
//! UploadMetadata   -> MetaAck, then UploadChunk* UploadEnd -> TransferResult
//! DownloadRequest  -> DownloadMetadata DownloadChunk* TransferResult
//!                  |  TransferResult (failure, no metadata)
//! ListFilesRequest -> ListFilesResponse
//! ```

mod messages;

pub use messages::{
    chunk_count, ChunkPayload, DownloadRequest, DownloadResponse, FileMetadata, ListFilesRequest,
    ListFilesResponse, MetaAck, PingPayload, PongPayload, SessionRequest, StoredItem,
    TransferResult, UploadRequest, UploadResponse, WireMessage,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Protocol magic bytes: "QBAK"
pub const MAGIC: [u8; 4] = [0x51, 0x42, 0x41, 0x4B];

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Default maximum payload size (16 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Bytes a chunk payload adds on top of its data
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Message types in the QBAK protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe
    Ping = 0x01,
    /// Liveness probe response
    Pong = 0x02,
    /// Upload: object metadata, opens an upload session
    UploadMetadata = 0x10,
    /// Upload: content chunk
    UploadChunk = 0x11,
    /// Upload: client has finished sending
    UploadEnd = 0x12,
    /// Upload: admission decision
    MetaAck = 0x13,
    /// Terminal outcome of an upload or download
    TransferResult = 0x14,
    /// Download: request an object, opens a download session
    DownloadRequest = 0x20,
    /// Download: object metadata
    DownloadMetadata = 0x21,
    /// Download: content chunk
    DownloadChunk = 0x22,
    /// List stored objects under a tag
    ListFilesRequest = 0x30,
    /// Listing result
    ListFilesResponse = 0x31,
}

impl MessageType {
    /// Parse a message type from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Pong),
            0x10 => Some(Self::UploadMetadata),
            0x11 => Some(Self::UploadChunk),
            0x12 => Some(Self::UploadEnd),
            0x13 => Some(Self::MetaAck),
            0x14 => Some(Self::TransferResult),
            0x20 => Some(Self::DownloadRequest),
            0x21 => Some(Self::DownloadMetadata),
            0x22 => Some(Self::DownloadChunk),
            0x30 => Some(Self::ListFilesRequest),
            0x31 => Some(Self::ListFilesResponse),
            _ => None,
        }
    }
}

/// A protocol frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Message type
    pub message_type: MessageType,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.message_type as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes, enforcing `max_payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE], max_payload: usize) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::Protocol("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }

        let message_type = MessageType::from_byte(buf[6])
            .ok_or_else(|| Error::Protocol(format!("unknown message type: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > max_payload {
            return Err(Error::Protocol(format!(
                "payload too large: {payload_length} bytes (limit {max_payload})"
            )));
        }

        Ok(Self {
            version,
            message_type,
            payload_length,
        })
    }
}

/// Encode a message payload to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read a complete frame from a stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly at a frame
/// boundary.
///
/// # Errors
///
/// Returns an error if reading fails, the stream ends mid-frame, or the
/// frame is invalid.
pub async fn read_frame<R>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<(FrameHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let n = reader.read(&mut header_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header_buf[n..]).await?;

    let header = FrameHeader::decode(&header_buf, max_payload)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Some((header, payload)))
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails or the payload exceeds the frame limit.
pub async fn write_frame<W>(writer: &mut W, message_type: MessageType, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload_length = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol(format!("payload too large: {} bytes", payload.len())))?;

    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        message_type,
        payload_length,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// A stream carrying typed QBAK messages.
///
/// The session driver owns the `Framed` value and is the only place the
/// underlying stream is shut down or dropped. Deadline-raced operations
/// borrow it for the duration of one send or receive; when the deadline wins
/// the in-flight future is dropped and the session is torn down.
#[derive(Debug)]
pub struct Framed<S> {
    stream: S,
    max_payload: usize,
}

impl<S> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream with the given maximum payload size.
    pub const fn new(stream: S, max_payload: usize) -> Self {
        Self {
            stream,
            max_payload,
        }
    }

    /// Maximum payload size accepted on this stream.
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub async fn send<M: WireMessage>(&mut self, message: &M) -> Result<()> {
        let (message_type, payload) = message.encode()?;
        if payload.len() > self.max_payload {
            return Err(Error::Protocol(format!(
                "{message_type:?} payload of {} bytes exceeds limit of {}",
                payload.len(),
                self.max_payload
            )));
        }
        write_frame(&mut self.stream, message_type, &payload).await
    }

    /// Receive one message, or `None` if the peer closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or decoding fails.
    pub async fn recv<M: WireMessage>(&mut self) -> Result<Option<M>> {
        match read_frame(&mut self.stream, self.max_payload).await? {
            Some((header, payload)) => M::decode(header.message_type, payload).map(Some),
            None => Ok(None),
        }
    }

    /// Send one message, racing it against `duration`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` naming `operation` if the deadline wins.
    pub async fn send_timeout<M: WireMessage>(
        &mut self,
        message: &M,
        duration: Duration,
        operation: &str,
    ) -> Result<()> {
        timeout(duration, self.send(message))
            .await
            .map_err(|_| Error::timeout(operation, duration))?
    }

    /// Receive one message, racing it against `duration`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` naming `operation` if the deadline wins.
    pub async fn recv_timeout<M: WireMessage>(
        &mut self,
        duration: Duration,
        operation: &str,
    ) -> Result<Option<M>> {
        timeout(duration, self.recv())
            .await
            .map_err(|_| Error::timeout(operation, duration))?
    }

    /// Receive one message, treating a closed stream as an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionLost` if the peer closed the stream.
    pub async fn expect_timeout<M: WireMessage>(
        &mut self,
        duration: Duration,
        operation: &str,
    ) -> Result<M> {
        self.recv_timeout(duration, operation)
            .await?
            .ok_or_else(|| Error::ConnectionLost(format!("stream closed while awaiting {operation}")))
    }

    /// Flush and shut down the write side of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
