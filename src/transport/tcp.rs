//! TCP transport implementation for development and non-Bluetooth hosts

use crate::transport::traits::{Transport, TransportListener, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btcomm_shared::PeerId;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use uuid::Uuid;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    peer: PeerId,
}

impl TcpTransportStream {
    /// Wrap a stream, identifying the remote end as `peer`
    pub fn new(stream: TcpStream, peer: PeerId) -> Self {
        Self {
            inner: stream,
            peer,
        }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for TcpTransportStream {
    fn peer(&self) -> PeerId {
        self.peer.clone()
    }
}

/// Listening TCP socket
pub struct TcpTransportListener {
    inner: TcpListener,
}

impl TcpTransportListener {
    /// Address the socket is actually bound to (resolves port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    type Stream = TcpTransportStream;

    async fn accept(&mut self) -> Result<Self::Stream> {
        let (stream, addr) = self.inner.accept().await?;
        Ok(TcpTransportStream::new(stream, PeerId::from(addr)))
    }
}

/// TCP transport. Peers are addressed as `host:port`; the service UUID is
/// only used for logging since TCP has no service records.
///
/// Outbound streams keep the identity the caller connected with, so
/// `connect_to("localhost:9000")` registers under `localhost:9000`.
pub struct TcpTransport {
    bind_address: String,
}

impl TcpTransport {
    /// Create a transport whose listening endpoints bind to `bind_address`
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new("127.0.0.1:9000")
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpTransportStream;
    type Listener = TcpTransportListener;

    async fn connect(&self, peer: &PeerId, service: Uuid) -> Result<Self::Stream> {
        debug!("[TCP] Connecting to {} for service {}", peer, service);
        let stream = TcpStream::connect(peer.as_str())
            .await
            .map_err(|e| anyhow!("TCP connect to {} failed: {}", peer, e))?;
        Ok(TcpTransportStream::new(stream, peer.clone()))
    }

    async fn listen(&self, service_name: &str, service: Uuid) -> Result<Self::Listener> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| anyhow!("TCP bind to {} failed: {}", self.bind_address, e))?;
        info!(
            "[TCP] Listening on {} as {} ({})",
            listener.local_addr()?,
            service_name,
            service
        );
        Ok(TcpTransportListener { inner: listener })
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}
