//! Typed QBAK messages and their payload encodings.

use serde::{Deserialize, Serialize};

use super::{decode_payload, encode_payload, MessageType, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};

/// A message that maps onto exactly one QBAK frame.
pub trait WireMessage: Sized {
    /// Encode into a frame type and payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn encode(&self) -> Result<(MessageType, Vec<u8>)>;

    /// Decode from a received frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame type is not valid for this message or
    /// the payload is malformed.
    fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self>;
}

fn unexpected(expected: &str, actual: MessageType) -> Error {
    Error::UnexpectedMessage {
        expected: expected.to_string(),
        actual: format!("{actual:?}"),
    }
}

macro_rules! json_message {
    ($ty:ty, $message_type:expr) => {
        impl WireMessage for $ty {
            fn encode(&self) -> Result<(MessageType, Vec<u8>)> {
                Ok(($message_type, encode_payload(self)?))
            }

            fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
                if message_type != $message_type {
                    return Err(unexpected(stringify!($ty), message_type));
                }
                decode_payload(&payload)
            }
        }
    };
}

/// Number of chunks needed to carry `size` bytes in `chunk_size` pieces.
///
/// Empty content has zero chunks.
#[must_use]
pub const fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

/// Metadata describing one object being transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Namespace the object lives in
    pub tag: String,
    /// Object name within the tag
    pub name: String,
    /// Total content size in bytes
    pub size: u64,
    /// Size of every chunk except possibly the last
    pub chunk_size: u64,
    /// Number of chunks, `ceil(size / chunk_size)`
    pub chunk_count: u64,
    /// Full-content hash (lowercase hex)
    pub hash: String,
}

impl FileMetadata {
    /// Build metadata, deriving the chunk count.
    #[must_use]
    pub fn new(
        tag: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        chunk_size: u64,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            name: name.into(),
            size,
            chunk_size,
            chunk_count: chunk_count(size, chunk_size),
            hash: hash.into(),
        }
    }

    /// Byte offset and length of the chunk with 1-based `sequence`.
    ///
    /// Returns `None` for sequences outside `1..=chunk_count`.
    #[must_use]
    pub fn chunk_bounds(&self, sequence: u64) -> Option<(u64, u64)> {
        if sequence == 0 || sequence > self.chunk_count {
            return None;
        }
        let offset = (sequence - 1) * self.chunk_size;
        let len = self.chunk_size.min(self.size.saturating_sub(offset));
        Some((offset, len))
    }
}

/// One slice of content, carried as a binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    /// 1-based position of this chunk
    pub sequence: u64,
    /// Chunk content
    pub data: Vec<u8>,
}

impl ChunkPayload {
    /// Encode as `sequence (u64 BE) | data`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode from a binary payload, reusing its allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is shorter than the sequence header.
    pub fn decode(mut payload: Vec<u8>) -> Result<Self> {
        if payload.len() < CHUNK_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "chunk payload too short: {} bytes",
                payload.len()
            )));
        }

        let mut seq = [0u8; CHUNK_HEADER_SIZE];
        seq.copy_from_slice(&payload[..CHUNK_HEADER_SIZE]);
        payload.drain(..CHUNK_HEADER_SIZE);

        Ok(Self {
            sequence: u64::from_be_bytes(seq),
            data: payload,
        })
    }
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Arbitrary status echoed back by the server
    pub status: bool,
}

json_message!(PingPayload, MessageType::Ping);

/// Reply to a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Status copied from the probe
    pub status: bool,
}

json_message!(PongPayload, MessageType::Pong);

/// Admission decision for an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaAck {
    /// Whether the server will accept chunks
    pub allow: bool,
    /// Human-readable reason
    pub message: String,
}

impl MetaAck {
    /// Accept the upload.
    pub fn allow(message: impl Into<String>) -> Self {
        Self {
            allow: true,
            message: message.into(),
        }
    }

    /// Refuse the upload.
    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            allow: false,
            message: message.into(),
        }
    }
}

/// Terminal outcome of an upload or download session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Whether the session succeeded
    pub status: bool,
    /// Human-readable detail
    pub message: String,
}

impl TransferResult {
    /// Successful outcome.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: true,
            message: message.into(),
        }
    }

    /// Failed outcome.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
        }
    }
}

json_message!(TransferResult, MessageType::TransferResult);

/// Request for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Namespace of the object
    pub tag: String,
    /// Object name
    pub name: String,
    /// Requested chunk size; non-positive values are rejected by the server
    pub chunk_size: i64,
}

json_message!(DownloadRequest, MessageType::DownloadRequest);

/// Request to enumerate a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesRequest {
    /// Namespace to enumerate
    pub tag: String,
}

json_message!(ListFilesRequest, MessageType::ListFilesRequest);

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Object name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Full-content hash (lowercase hex)
    pub hash: String,
    /// Last modification time, unix seconds
    pub modified_time: i64,
}

/// Listing result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilesResponse {
    /// Whether the listing succeeded
    pub status: bool,
    /// Human-readable detail
    pub message: String,
    /// Entries, sorted by name
    #[serde(default)]
    pub files: Vec<StoredItem>,
}

impl ListFilesResponse {
    /// Failed listing with no entries.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: message.into(),
            files: Vec::new(),
        }
    }
}

json_message!(ListFilesResponse, MessageType::ListFilesResponse);

/// Messages a client sends during an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadRequest {
    /// Object metadata, always first
    Metadata(FileMetadata),
    /// A content chunk
    Chunk(ChunkPayload),
    /// The client has finished sending
    End,
}

impl WireMessage for UploadRequest {
    fn encode(&self) -> Result<(MessageType, Vec<u8>)> {
        match self {
            Self::Metadata(meta) => Ok((MessageType::UploadMetadata, encode_payload(meta)?)),
            Self::Chunk(chunk) => Ok((MessageType::UploadChunk, chunk.encode())),
            Self::End => Ok((MessageType::UploadEnd, Vec::new())),
        }
    }

    fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        match message_type {
            MessageType::UploadMetadata => decode_payload(&payload).map(Self::Metadata),
            MessageType::UploadChunk => ChunkPayload::decode(payload).map(Self::Chunk),
            MessageType::UploadEnd => Ok(Self::End),
            other => Err(unexpected("upload request", other)),
        }
    }
}

/// Messages a server sends during an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResponse {
    /// Admission decision
    MetaAck(MetaAck),
    /// Terminal outcome
    Result(TransferResult),
}

impl WireMessage for UploadResponse {
    fn encode(&self) -> Result<(MessageType, Vec<u8>)> {
        match self {
            Self::MetaAck(ack) => Ok((MessageType::MetaAck, encode_payload(ack)?)),
            Self::Result(result) => result.encode(),
        }
    }

    fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        match message_type {
            MessageType::MetaAck => decode_payload(&payload).map(Self::MetaAck),
            MessageType::TransferResult => decode_payload(&payload).map(Self::Result),
            other => Err(unexpected("upload response", other)),
        }
    }
}

/// Messages a server sends during a download session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadResponse {
    /// Object metadata, sent before any chunk
    Metadata(FileMetadata),
    /// A content chunk
    Chunk(ChunkPayload),
    /// Terminal outcome
    Result(TransferResult),
}

impl WireMessage for DownloadResponse {
    fn encode(&self) -> Result<(MessageType, Vec<u8>)> {
        match self {
            Self::Metadata(meta) => Ok((MessageType::DownloadMetadata, encode_payload(meta)?)),
            Self::Chunk(chunk) => Ok((MessageType::DownloadChunk, chunk.encode())),
            Self::Result(result) => result.encode(),
        }
    }

    fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        match message_type {
            MessageType::DownloadMetadata => decode_payload(&payload).map(Self::Metadata),
            MessageType::DownloadChunk => ChunkPayload::decode(payload).map(Self::Chunk),
            MessageType::TransferResult => decode_payload(&payload).map(Self::Result),
            other => Err(unexpected("download response", other)),
        }
    }
}

/// First frame of a connection, selecting the session kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Liveness probe
    Ping(PingPayload),
    /// Upload session, carrying its metadata
    Upload(FileMetadata),
    /// Download session
    Download(DownloadRequest),
    /// Listing
    ListFiles(ListFilesRequest),
    /// Upload content arrived before any metadata
    MissingMetadata,
}

impl WireMessage for SessionRequest {
    fn encode(&self) -> Result<(MessageType, Vec<u8>)> {
        match self {
            Self::Ping(ping) => ping.encode(),
            Self::Upload(meta) => UploadRequest::Metadata(meta.clone()).encode(),
            Self::Download(request) => request.encode(),
            Self::ListFiles(request) => request.encode(),
            Self::MissingMetadata => UploadRequest::End.encode(),
        }
    }

    fn decode(message_type: MessageType, payload: Vec<u8>) -> Result<Self> {
        match message_type {
            MessageType::Ping => decode_payload(&payload).map(Self::Ping),
            MessageType::UploadMetadata => decode_payload(&payload).map(Self::Upload),
            MessageType::UploadChunk | MessageType::UploadEnd => Ok(Self::MissingMetadata),
            MessageType::DownloadRequest => decode_payload(&payload).map(Self::Download),
            MessageType::ListFilesRequest => decode_payload(&payload).map(Self::ListFiles),
            other => Err(unexpected("session request", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 4), 0);
        assert_eq!(chunk_count(1, 4), 1);
        assert_eq!(chunk_count(4, 4), 1);
        assert_eq!(chunk_count(5, 4), 2);
        assert_eq!(chunk_count(9, 4), 3);
        assert_eq!(chunk_count(9, 0), 0);
    }

    #[test]
    fn test_chunking_example() {
        let content = b"ABCDEFGHI";
        let meta = FileMetadata::new("t", "letters", content.len() as u64, 4, "h");
        assert_eq!(meta.chunk_count, 3);

        let chunks: Vec<(u64, &[u8])> = (1..=meta.chunk_count)
            .map(|seq| {
                let (offset, len) = meta.chunk_bounds(seq).unwrap();
                (seq, &content[offset as usize..(offset + len) as usize])
            })
            .collect();

        assert_eq!(
            chunks,
            vec![(1, &b"ABCD"[..]), (2, &b"EFGH"[..]), (3, &b"I"[..])]
        );
        assert_eq!(meta.chunk_bounds(0), None);
        assert_eq!(meta.chunk_bounds(4), None);
    }

    #[test]
    fn test_chunks_reconstruct_content() {
        let content: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();

        for chunk_size in [1u64, 3, 64, 999, 1000, 4096] {
            let meta = FileMetadata::new("t", "n", content.len() as u64, chunk_size, "h");
            let mut rebuilt = Vec::new();
            for seq in 1..=meta.chunk_count {
                let (offset, len) = meta.chunk_bounds(seq).unwrap();
                rebuilt.extend_from_slice(&content[offset as usize..(offset + len) as usize]);
            }
            assert_eq!(rebuilt, content, "chunk size {chunk_size}");
            assert_eq!(
                crate::hash::hash_bytes(&rebuilt),
                crate::hash::hash_bytes(&content)
            );
        }
    }

    #[test]
    fn test_chunk_payload_layout() {
        let chunk = ChunkPayload {
            sequence: 2,
            data: b"EFGH".to_vec(),
        };
        let encoded = chunk.encode();
        assert_eq!(&encoded[..8], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(&encoded[8..], b"EFGH");

        assert_eq!(ChunkPayload::decode(encoded).unwrap(), chunk);
        assert!(ChunkPayload::decode(vec![0, 1, 2]).is_err());
    }

    #[test]
    fn test_empty_chunk_payload_decodes() {
        let decoded = ChunkPayload::decode(7u64.to_be_bytes().to_vec()).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_upload_request_discriminated_by_frame_type() {
        let (ty, payload) = UploadRequest::End.encode().unwrap();
        assert_eq!(ty, MessageType::UploadEnd);
        assert!(payload.is_empty());

        let meta = FileMetadata::new("backups", "db.dump", 10, 4, "abc");
        let (ty, payload) = UploadRequest::Metadata(meta.clone()).encode().unwrap();
        assert_eq!(ty, MessageType::UploadMetadata);
        assert_eq!(
            UploadRequest::decode(ty, payload).unwrap(),
            UploadRequest::Metadata(meta)
        );

        assert!(matches!(
            UploadRequest::decode(MessageType::Pong, Vec::new()),
            Err(Error::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_download_response_variants() {
        let result = TransferResult::failure("file does not exist");
        let (ty, payload) = DownloadResponse::Result(result.clone()).encode().unwrap();
        assert_eq!(ty, MessageType::TransferResult);
        assert_eq!(
            DownloadResponse::decode(ty, payload).unwrap(),
            DownloadResponse::Result(result)
        );

        let (ty, payload) = DownloadResponse::Chunk(ChunkPayload {
            sequence: 1,
            data: vec![9; 3],
        })
        .encode()
        .unwrap();
        assert_eq!(ty, MessageType::DownloadChunk);
        assert!(matches!(
            DownloadResponse::decode(ty, payload).unwrap(),
            DownloadResponse::Chunk(ChunkPayload { sequence: 1, .. })
        ));
    }

    #[test]
    fn test_session_request_dispatch() {
        assert_eq!(
            SessionRequest::decode(MessageType::UploadChunk, vec![0; 8]).unwrap(),
            SessionRequest::MissingMetadata
        );

        let (ty, payload) = ListFilesRequest {
            tag: "photos".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            SessionRequest::decode(ty, payload).unwrap(),
            SessionRequest::ListFiles(ListFilesRequest {
                tag: "photos".to_string()
            })
        );

        assert!(SessionRequest::decode(MessageType::MetaAck, Vec::new()).is_err());
    }

    #[test]
    fn test_list_response_files_default_to_empty() {
        let decoded: ListFilesResponse =
            decode_payload(br#"{"status":false,"message":"folder not exists"}"#).unwrap();
        assert!(decoded.files.is_empty());
        assert!(!decoded.status);
    }
}
