//! Storage server.
//!
//! The server accepts connections, optionally completes a mutual-TLS
//! handshake, and runs one session per connection on its own task. The first
//! frame selects the session:
//!
//! - `Ping` is echoed as `Pong`
//! - `UploadMetadata` starts an upload ([`upload`])
//! - `DownloadRequest` starts a download ([`download`])
//! - `ListFilesRequest` returns a listing ([`listing`])
//!
//! Sessions share only the read-only [`ServerContext`]. All per-transfer
//! state lives on the handler's stack.

mod download;
mod listing;
mod upload;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::connection::accept_stream;
use crate::crypto::TlsConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    Framed, PongPayload, SessionRequest, TransferResult, UploadResponse, WireMessage,
};
use crate::storage::Backend;

/// Read-only state shared by every session.
#[derive(Debug)]
pub struct ServerContext {
    /// Storage backend selected at start
    pub backend: Backend,
    /// TLS material, when mutual TLS is required
    pub tls: Option<TlsConfig>,
    /// Transport limits and deadlines
    pub transport: TransportConfig,
}

impl ServerContext {
    /// Build a context.
    pub fn new(backend: Backend, tls: Option<TlsConfig>, transport: TransportConfig) -> Self {
        Self {
            backend,
            tls,
            transport,
        }
    }
}

/// A bound storage server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the listen socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(address: &str, context: ServerContext) -> Result<Self> {
        let addr = crate::connection::resolve_address(address).await?;
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Connect {
            addr: addr.to_string(),
            source: e,
        })?;

        Ok(Self {
            listener,
            context: Arc::new(context),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until the shutdown token is cancelled.
    ///
    /// Sessions already running are left to finish on their own.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener cannot report its address.
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            "Listening on {} ({} backend, {})",
            self.local_addr()?,
            self.context.backend.mode(),
            if self.context.tls.is_some() {
                "mutual TLS"
            } else {
                "plaintext"
            }
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let context = Arc::clone(&self.context);
                    let span = tracing::info_span!(
                        "session",
                        id = %Uuid::new_v4().simple(),
                        peer = %peer
                    );

                    tokio::spawn(
                        async move {
                            tracing::debug!("Connection accepted");
                            let stream = match accept_stream(
                                stream,
                                context.tls.as_ref(),
                                &context.transport,
                            )
                            .await
                            {
                                Ok(stream) => stream,
                                Err(e) => {
                                    tracing::warn!("Connection setup failed: {}", e);
                                    return;
                                }
                            };

                            if let Err(e) = handle_connection(stream, &context).await {
                                tracing::warn!("Session failed: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        Ok(())
    }
}

/// Run one session over an established stream.
///
/// # Errors
///
/// Returns an error if the session failed. Failures are reported to the
/// peer whenever the stream is still writable.
pub async fn handle_connection<S>(stream: S, context: &ServerContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let transport = &context.transport;
    let mut framed = Framed::new(stream, transport.max_message_size);

    let request = match framed
        .recv_timeout::<SessionRequest>(transport.idle_timeout, "first request")
        .await?
    {
        Some(request) => request,
        None => {
            tracing::debug!("Peer closed the connection without a request");
            return Ok(());
        }
    };

    let result = match request {
        SessionRequest::Ping(ping) => {
            tracing::debug!("Ping (status={})", ping.status);
            framed
                .send_timeout(
                    &PongPayload {
                        status: ping.status,
                    },
                    transport.idle_timeout,
                    "pong",
                )
                .await
        }
        SessionRequest::Upload(meta) => upload::handle(&mut framed, context, meta).await,
        SessionRequest::Download(request) => {
            download::handle(&mut framed, context, request).await
        }
        SessionRequest::ListFiles(request) => {
            listing::handle(&mut framed, context, request).await
        }
        SessionRequest::MissingMetadata => {
            send_best_effort(
                &mut framed,
                &UploadResponse::Result(TransferResult::failure("Missing metadata")),
                transport.idle_timeout,
            )
            .await;
            Err(Error::Protocol(
                "upload content arrived before metadata".to_string(),
            ))
        }
    };

    if let Err(e) = framed.shutdown().await {
        tracing::trace!("Stream shutdown failed: {}", e);
    }
    result
}

/// Send a message whose delivery is not essential, logging failures.
async fn send_best_effort<S, M>(framed: &mut Framed<S>, message: &M, deadline: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: WireMessage + std::fmt::Debug,
{
    if let Err(e) = framed.send_timeout(message, deadline, "failure report").await {
        tracing::debug!("Could not deliver {:?}: {}", message, e);
    }
}
