//! # qback Core Library
//!
//! `qback-core` provides the core functionality for qback, a point-to-point
//! file transfer service between a client and a storage server.
//!
//! ## Features
//!
//! - **Chunked transfers**: content is split into bounded-size chunks and
//!   streamed in order over a single connection
//! - **End-to-end integrity**: every object is verified with a full-content
//!   BLAKE3 hash before it is accepted as durable
//! - **Mutual TLS**: both peers authenticate with certificates from a shared CA
//! - **Two storage backends**: a persistent directory store and a transient
//!   memory store for throughput benchmarking
//!
//! ## Modules
//!
//! - [`client`] - Client API (upload, download, list, ping)
//! - [`config`] - Configuration management
//! - [`connection`] - Connection setup, keep-alive and retry policy
//! - [`crypto`] - TLS configuration and certificate material
//! - [`hash`] - Streaming content hashing
//! - [`protocol`] - QBAK wire protocol implementation
//! - [`server`] - Storage server and its session handlers
//! - [`storage`] - Directory and memory storage backends
//! - [`transfer`] - Client-side upload and download sessions
//!
//! ## Example
//!
//! ```rust,ignore
//! use qback_core::client::Client;
//! use qback_core::config::Config;
//!
//! let client = Client::new(&Config::default(), None)?;
//! let outcome = client.upload("backups", "./db.dump").await?;
//! println!("{outcome}");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for QBAK frames
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default server port (TCP)
pub const DEFAULT_PORT: u16 = 50051;

/// Default chunk size for file transfers (1 MB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default per-chunk send/receive timeout in seconds
pub const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 30;

/// Buffer size for file writers and readers (64 KB)
pub const IO_BUFFER_SIZE: usize = 64 * 1024;
