//! RFCOMM transport implementation for Bluetooth connections
//!
//! Listening and connecting both go through BlueZ profile registration, so
//! peers find each other by service UUID the same way an SDP service record
//! lookup does, rather than by a hard-coded channel number.

use crate::transport::bt_discovery::{BtDiscovery, DiscoveryConfig};
use crate::transport::traits::{DiscoveredPeer, Transport, TransportListener, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::rfcomm::{Profile, ProfileHandle, Role, Stream as RfcommStream};
use bluer::{Adapter, Address};
use btcomm_shared::PeerId;
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Get the peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
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

impl TransportStream for RfcommTransportStream {
    fn peer(&self) -> PeerId {
        PeerId::from(self.peer_addr.to_string())
    }
}

/// Parse a peer identity back into a Bluetooth address
pub fn peer_address(peer: &PeerId) -> Result<Address> {
    peer.as_str()
        .parse::<Address>()
        .map_err(|e| anyhow!("Invalid Bluetooth address {}: {}", peer, e))
}

/// Configuration for the RFCOMM transport
#[derive(Debug, Clone, Default)]
pub struct RfcommConfig {
    /// Fixed RFCOMM channel for listening; BlueZ picks one when unset
    pub channel: Option<u8>,
    /// Require the link to be authenticated (paired)
    pub require_authentication: bool,
    /// Require user authorization for inbound connections
    pub require_authorization: bool,
    /// Discovery configuration
    pub discovery: DiscoveryConfig,
}

/// Inbound connection requests for a registered server profile
pub struct RfcommListener {
    handle: ProfileHandle,
}

#[async_trait]
impl TransportListener for RfcommListener {
    type Stream = RfcommTransportStream;

    async fn accept(&mut self) -> Result<Self::Stream> {
        let request = self
            .handle
            .next()
            .await
            .ok_or_else(|| anyhow!("RFCOMM profile unregistered"))?;
        let address = request.device();
        let stream = request.accept()?;
        debug!("[BT] Accepted RFCOMM connection from {}", address);
        Ok(RfcommTransportStream::new(stream, address))
    }
}

/// Bluetooth RFCOMM transport backed by BlueZ
pub struct RfcommTransport {
    session: bluer::Session,
    adapter: Adapter,
    config: RfcommConfig,
}

impl RfcommTransport {
    /// Open the default adapter, powering it on if needed
    pub async fn new(config: RfcommConfig) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        if !adapter.is_powered().await? {
            info!("[BT] Powering on adapter {}", adapter.name());
            adapter.set_powered(true).await?;
        }
        Ok(Self {
            session,
            adapter,
            config,
        })
    }

    /// The adapter this transport uses
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn profile(&self, role: Role, service: Uuid) -> Profile {
        Profile {
            uuid: service,
            role: Some(role),
            require_authentication: Some(self.config.require_authentication),
            require_authorization: Some(self.config.require_authorization),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transport for RfcommTransport {
    type Stream = RfcommTransportStream;
    type Listener = RfcommListener;

    async fn connect(&self, peer: &PeerId, service: Uuid) -> Result<Self::Stream> {
        let address = peer_address(peer)?;
        let device = self.adapter.device(address)?;

        let profile = Profile {
            service: Some(service),
            ..self.profile(Role::Client, service)
        };
        let mut handle = self.session.register_profile(profile).await?;

        info!("[BT] Connecting to {} for service {}", address, service);
        let connect = device.connect_profile(&service);
        tokio::pin!(connect);
        let mut profile_connected = false;

        loop {
            tokio::select! {
                result = &mut connect, if !profile_connected => {
                    result.map_err(|e| anyhow!("RFCOMM connect to {} failed: {}", address, e))?;
                    profile_connected = true;
                }
                request = handle.next() => {
                    let request = request
                        .ok_or_else(|| anyhow!("RFCOMM client profile unregistered"))?;
                    if request.device() != address {
                        warn!(
                            "[BT] Ignoring connection from unexpected device {}",
                            request.device()
                        );
                        continue;
                    }
                    let stream = request.accept()?;
                    info!("[BT] Connected to {}", address);
                    return Ok(RfcommTransportStream::new(stream, address));
                }
            }
        }
    }

    async fn listen(&self, service_name: &str, service: Uuid) -> Result<Self::Listener> {
        let profile = Profile {
            name: Some(service_name.to_string()),
            channel: self.config.channel.map(u16::from),
            ..self.profile(Role::Server, service)
        };
        let handle = self
            .session
            .register_profile(profile)
            .await
            .map_err(|e| anyhow!("RFCOMM profile registration failed: {}", e))?;
        info!("[BT] Listening as {} ({})", service_name, service);
        Ok(RfcommListener { handle })
    }

    async fn discover(&self, found: mpsc::UnboundedSender<DiscoveredPeer>) -> Result<()> {
        BtDiscovery::new(self.config.discovery.clone())
            .scan(&self.adapter, found)
            .await
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RfcommConfig::default();
        assert!(config.channel.is_none());
        assert!(!config.require_authentication);
        assert!(!config.require_authorization);
    }

    #[test]
    fn test_peer_address_roundtrip() {
        let addr = Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let peer = PeerId::from(addr.to_string());
        assert_eq!(peer_address(&peer).unwrap(), addr);
        assert!(peer_address(&PeerId::from("not-an-address")).is_err());
    }
}
