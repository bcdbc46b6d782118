//! Transport trait abstraction for pluggable stream backends

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btcomm_shared::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connected byte stream to one remote device
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Identity of the remote end of this stream
    fn peer(&self) -> PeerId;
}

/// Boxed stream as stored by sessions
pub type BoxedStream = Box<dyn TransportStream>;

/// A device found while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub peer: PeerId,
    /// Human-readable device name, if the remote advertised one
    pub name: Option<String>,
}

/// A bound listening endpoint
#[async_trait]
pub trait TransportListener: Send + 'static {
    type Stream: TransportStream;

    /// Block until the next inbound connection arrives
    async fn accept(&mut self) -> Result<Self::Stream>;
}

/// Factory for outbound connections and listening endpoints
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The stream type this transport produces
    type Stream: TransportStream;
    /// The listener type returned by [`Transport::listen`]
    type Listener: TransportListener<Stream = Self::Stream>;

    /// Connect to `peer`, matching the remote service by `service`
    async fn connect(&self, peer: &PeerId, service: Uuid) -> Result<Self::Stream>;

    /// Open a listening endpoint advertised as `(service_name, service)`
    async fn listen(&self, service_name: &str, service: Uuid) -> Result<Self::Listener>;

    /// Scan for nearby devices, pushing each new one into `found` until the
    /// scan ends or the receiver is dropped
    async fn discover(&self, found: mpsc::UnboundedSender<DiscoveredPeer>) -> Result<()> {
        let _ = found;
        Err(anyhow!("{} transport does not support discovery", self.name()))
    }

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
