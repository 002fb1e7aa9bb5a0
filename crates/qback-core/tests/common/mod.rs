//! Common test utilities for `qback` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qback_core::client::Client;
use qback_core::config::{RetryConfig, TransportConfig};
use qback_core::connection::Connector;
use qback_core::crypto::TlsConfig;
use qback_core::server::{Server, ServerContext};
use qback_core::storage::{Backend, DirectoryStore, MemoryStore};
use qback_core::transfer::TransferConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A server running on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<qback_core::Result<()>>,
}

impl TestServer {
    /// Stop accepting and wait for the accept loop to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Transport settings with short deadlines and no connection retries.
pub fn test_transport() -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(10),
        ping_timeout: Duration::from_secs(5),
        retry: RetryConfig::no_retry(),
        ..TransportConfig::default()
    }
}

/// Session parameters with small chunks so tests cover several chunks.
pub fn test_transfer(chunk_size: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        chunk_timeout: Duration::from_secs(5),
        response_timeout: Duration::from_secs(10),
        ..TransferConfig::default()
    }
}

/// Start a directory-backed server rooted at `root`.
pub async fn start_directory_server(root: &Path, tls: Option<TlsConfig>) -> TestServer {
    let store = DirectoryStore::open(root)
        .await
        .expect("Failed to open directory store");
    start_server(Backend::Directory(store), tls).await
}

/// Start a memory-backed server.
pub async fn start_memory_server() -> TestServer {
    start_server(Backend::Memory(MemoryStore::new()), None).await
}

/// Start a server with the given backend on `127.0.0.1:0`.
pub async fn start_server(backend: Backend, tls: Option<TlsConfig>) -> TestServer {
    let context = ServerContext::new(backend, tls, test_transport());
    let server = Server::bind("127.0.0.1:0", context)
        .await
        .expect("Failed to bind server");
    let addr = server.local_addr().expect("Server has no local address");
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());

    TestServer {
        addr,
        shutdown,
        handle,
    }
}

/// Client for a test server.
pub fn client_for(addr: SocketAddr, tls: Option<TlsConfig>, chunk_size: usize) -> Client {
    Client::from_parts(
        Connector::new(addr.to_string(), tls, test_transport()),
        test_transfer(chunk_size),
    )
}
