//! Client API.
//!
//! A [`Client`] opens one connection per operation, the same way the server
//! runs one session per connection.
//!
//! ```rust,ignore
//! use qback_core::client::Client;
//! use qback_core::config::Config;
//!
//! let client = Client::new(&Config::load()?, None)?;
//! let outcome = client.upload("backups", "./db.dump").await?;
//! println!("{outcome}");
//! ```

use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::{Config, TransportConfig};
use crate::connection::{BoxedStream, Connector};
use crate::crypto::TlsConfig;
use crate::error::{Error, Result};
use crate::protocol::{Framed, ListFilesRequest, ListFilesResponse, PingPayload, PongPayload, StoredItem};
use crate::transfer::{
    DownloadOutcome, DownloadSession, TransferConfig, UploadOutcome, UploadSession, UploadSource,
};

/// Client for one qback server.
#[derive(Debug, Clone)]
pub struct Client {
    connector: Connector,
    transfer: TransferConfig,
}

impl Client {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &Config, tls: Option<TlsConfig>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            Connector::new(config.client.address.clone(), tls, config.transport.clone()),
            config.transfer_config(),
        ))
    }

    /// Build a client from an explicit connector and session parameters.
    pub fn from_parts(connector: Connector, transfer: TransferConfig) -> Self {
        Self {
            connector,
            transfer,
        }
    }

    /// Session parameters used for transfers.
    pub const fn transfer_config(&self) -> &TransferConfig {
        &self.transfer
    }

    fn transport(&self) -> &TransportConfig {
        self.connector.transport()
    }

    /// Open a framed connection to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(&self) -> Result<Framed<BoxedStream>> {
        let stream = self.connector.connect().await?;
        tracing::debug!("Connected to {}", self.connector.address());
        Ok(Framed::new(stream, self.transport().max_message_size))
    }

    /// Check that the server answers, returning the round-trip time
    /// including connection setup.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or does not answer
    /// within the ping timeout.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let mut framed = self.connect().await?;
        let deadline = self.transport().ping_timeout;

        framed
            .send_timeout(&PingPayload { status: true }, deadline, "ping")
            .await?;
        let pong: PongPayload = framed.expect_timeout(deadline, "ping reply").await?;
        if !pong.status {
            return Err(Error::Remote("server reported an unhealthy status".to_string()));
        }

        Ok(started.elapsed())
    }

    /// Upload `source` (a file path or `benchmark://<name>/<size>`) under `tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is invalid or the transfer fails.
    pub async fn upload(&self, tag: &str, source: &str) -> Result<UploadOutcome> {
        let source = UploadSource::resolve(source).await?;
        let session = UploadSession::prepare(tag, source, self.transfer.clone()).await?;
        self.run_upload(&session).await
    }

    /// Connect and drive a prepared upload session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the transfer fails.
    pub async fn run_upload(&self, session: &UploadSession) -> Result<UploadOutcome> {
        let mut framed = self.connect().await?;
        let outcome = session.run(&mut framed).await;
        let _ = framed.shutdown().await;
        outcome
    }

    /// Download `(tag, name)` to `<dest_root>/<tag>/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target exists or the transfer fails.
    pub async fn download(&self, tag: &str, name: &str, dest_root: &Path) -> Result<DownloadOutcome> {
        let session = DownloadSession::new(tag, name, dest_root, self.transfer.clone())?;
        self.run_download(&session).await
    }

    /// Connect and drive a download session.
    ///
    /// The local target is checked before connecting.
    ///
    /// # Errors
    ///
    /// Returns an error if the target exists, the connection fails or the
    /// transfer fails.
    pub async fn run_download(&self, session: &DownloadSession) -> Result<DownloadOutcome> {
        session.check_target().await?;
        let mut framed = self.connect().await?;
        let outcome = session.run(&mut framed).await;
        let _ = framed.shutdown().await;
        outcome
    }

    /// List the objects stored under `tag`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Remote` with the server's message if the listing is
    /// refused, or an error if the exchange fails.
    pub async fn list(&self, tag: &str) -> Result<Vec<StoredItem>> {
        let mut framed = self.connect().await?;
        let transport = self.transport();

        framed
            .send_timeout(
                &ListFilesRequest {
                    tag: tag.to_string(),
                },
                transport.response_timeout,
                "list request",
            )
            .await?;
        let response: ListFilesResponse = framed
            .expect_timeout(transport.response_timeout, "list response")
            .await?;

        if response.status {
            tracing::debug!("{}: {} objects", response.message, response.files.len());
            Ok(response.files)
        } else {
            Err(Error::Remote(response.message))
        }
    }
}
