//! Connection setup for qback peers.
//!
//! This module turns an address string into a ready-to-use byte stream:
//! address parsing, TCP connect with a deadline, keep-alive, the optional
//! mutual-TLS handshake, and bounded retry with exponential backoff.
//!
//! Retries cover connection establishment only. Once a stream has been
//! handed to a session, nothing is retried.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{RetryConfig, TransportConfig};
use crate::crypto::TlsConfig;
use crate::error::{Error, Result};
use crate::DEFAULT_PORT;

/// A bidirectional byte stream, plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A type-erased connection stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Parse a host address string into a `SocketAddr`.
///
/// Accepts formats:
/// - `IP` (e.g., `192.168.1.100`) - uses default port 50051
/// - `IP:PORT` (e.g., `192.168.1.100:6000`) - uses specified port
/// - `[IPv6]` (e.g., `[::1]`) - uses default port 50051
/// - `[IPv6]:PORT` (e.g., `[::1]:6000`) - uses specified port
///
/// # Examples
///
/// ```
/// use qback_core::connection::parse_host_address;
///
/// let addr = parse_host_address("192.168.1.100").unwrap();
/// assert_eq!(addr.port(), 50051);
///
/// let addr = parse_host_address("192.168.1.100:6000").unwrap();
/// assert_eq!(addr.port(), 6000);
/// ```
///
/// # Errors
///
/// Returns an error if the host string cannot be parsed.
pub fn parse_host_address(host: &str) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "Invalid address '{host}'. Use IP or IP:PORT (e.g., 127.0.0.1 or 127.0.0.1:{DEFAULT_PORT})"
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Some(ip_str) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = ip_str.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((ip_part, port_part)) = host.rsplit_once(':') {
        if !ip_part.contains(':') {
            let ip: IpAddr = ip_part.parse().map_err(|_| invalid())?;
            let port: u16 = port_part.parse().map_err(|_| {
                Error::InvalidInput(format!(
                    "Invalid port '{port_part}'. Port must be a number between 1 and 65535"
                ))
            })?;
            return Ok(SocketAddr::new(ip, port));
        }
    }

    Err(invalid())
}

/// Resolve an address that may use a host name (e.g. `localhost:50051`).
///
/// # Errors
///
/// Returns `Error::InvalidInput` if the address cannot be parsed or resolves
/// to nothing.
pub async fn resolve_address(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = parse_host_address(host) {
        return Ok(addr);
    }

    let host = host.trim();
    let target = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_PORT}")
    };

    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| Error::InvalidInput(format!("Cannot resolve '{host}': {e}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("'{host}' resolved to no addresses")))
}

/// Configure TCP keep-alive on a socket.
///
/// This enables OS-level TCP keep-alive so long transfers over NAT or
/// firewalls are not cut off while one side is busy hashing or writing.
pub fn configure_tcp_keepalive(stream: &TcpStream, transport: &TransportConfig) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(transport.keepalive_idle)
        .with_interval(transport.keepalive_interval);

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(io::Error::other(e)))?;

    tracing::trace!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Run `attempt` until it succeeds, fails with a non-recoverable error, or
/// the policy's attempts are exhausted.
///
/// # Errors
///
/// Returns the last error from `attempt`.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, mut attempt: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_recoverable() && n < max_attempts => {
                let delay = policy.backoff(n);
                tracing::warn!(
                    "Attempt {}/{} failed: {}; retrying in {:.1}s",
                    n,
                    max_attempts,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Opens client connections to one server.
#[derive(Debug, Clone)]
pub struct Connector {
    address: String,
    tls: Option<TlsConfig>,
    transport: TransportConfig,
}

impl Connector {
    /// Create a connector for `address`, using mutual TLS when `tls` is set.
    pub fn new(address: impl Into<String>, tls: Option<TlsConfig>, transport: TransportConfig) -> Self {
        Self {
            address: address.into(),
            tls,
            transport,
        }
    }

    /// Server address as configured.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Transport settings.
    pub const fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Connect, retrying connection failures per the retry policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` once retries are exhausted, `Error::Tls` if
    /// the handshake is refused, or `Error::InvalidInput` for a bad address.
    pub async fn connect(&self) -> Result<BoxedStream> {
        let addr = resolve_address(&self.address).await?;
        with_retry(&self.transport.retry, |attempt| async move {
            tracing::debug!("Connecting to {} (attempt {})", addr, attempt);
            self.connect_once(addr).await
        })
        .await
    }

    async fn connect_once(&self, addr: SocketAddr) -> Result<BoxedStream> {
        let connect_timeout = self.transport.connect_timeout;
        let connect_err = |source: io::Error| Error::Connect {
            addr: addr.to_string(),
            source,
        };

        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                connect_err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {}s", connect_timeout.as_secs()),
                ))
            })?
            .map_err(connect_err)?;

        stream.set_nodelay(true)?;
        configure_tcp_keepalive(&stream, &self.transport)?;

        let Some((connector, server_name)) = self.tls.as_ref().and_then(TlsConfig::connector)
        else {
            return Ok(Box::new(stream));
        };

        match timeout(connect_timeout, connector.connect(server_name, stream)).await {
            Ok(Ok(tls_stream)) => Ok(Box::new(tls_stream)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(Error::Tls(format!("handshake with {addr} failed: {e}")))
            }
            Ok(Err(e)) => Err(connect_err(e)),
            Err(_) => Err(connect_err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ))),
        }
    }
}

/// Prepare an accepted server-side socket, completing the TLS handshake
/// when an acceptor is configured.
///
/// # Errors
///
/// Returns an error if socket setup or the handshake fails.
pub async fn accept_stream(
    stream: TcpStream,
    tls: Option<&TlsConfig>,
    transport: &TransportConfig,
) -> Result<BoxedStream> {
    stream.set_nodelay(true)?;
    configure_tcp_keepalive(&stream, transport)?;

    let Some(acceptor) = tls.and_then(TlsConfig::acceptor) else {
        return Ok(Box::new(stream));
    };

    match timeout(transport.connect_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => Ok(Box::new(tls_stream)),
        Ok(Err(e)) => Err(Error::Tls(format!("handshake failed: {e}"))),
        Err(_) => Err(Error::timeout("TLS handshake", transport.connect_timeout)),
    }
}
