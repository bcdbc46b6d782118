//! In-process loopback transport
//!
//! A [`MemoryNetwork`] is a shared table of listening endpoints keyed by
//! `(node, service)`. Each [`MemoryTransport`] is one node on that network.
//! Connections are `tokio::io::duplex` pairs, so reads, writes, EOF and
//! close behave like a real socket without touching the OS.

use crate::transport::traits::{DiscoveredPeer, Transport, TransportListener, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btcomm_shared::PeerId;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Per-direction buffer of each in-memory connection
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

type EndpointKey = (PeerId, Uuid);

struct Endpoint {
    service_name: String,
    generation: u64,
    incoming: mpsc::UnboundedSender<MemoryStream>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<EndpointKey, Endpoint>,
    next_generation: u64,
}

/// Shared registry of in-memory listening endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport acting as node `local` on this network
    pub fn transport(&self, local: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: local.into(),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }

    /// Number of endpoints currently accepting connections
    pub fn listening_endpoints(&self) -> usize {
        self.lock().endpoints.len()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-memory connection
pub struct MemoryStream {
    inner: DuplexStream,
    peer: PeerId,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
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

impl TransportStream for MemoryStream {
    fn peer(&self) -> PeerId {
        self.peer.clone()
    }
}

/// Listening endpoint; unregisters itself when dropped
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryStream>,
    key: EndpointKey,
    generation: u64,
    network: MemoryNetwork,
}

#[async_trait]
impl TransportListener for MemoryListener {
    type Stream = MemoryStream;

    async fn accept(&mut self) -> Result<Self::Stream> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| anyhow!("Listener for {} closed", self.key.0))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let mut state = self.network.lock();
        if state
            .endpoints
            .get(&self.key)
            .is_some_and(|ep| ep.generation == self.generation)
        {
            state.endpoints.remove(&self.key);
        }
    }
}

/// A node on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
    pipe_capacity: usize,
}

impl MemoryTransport {
    /// Identity other nodes see for connections from this node
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Stream = MemoryStream;
    type Listener = MemoryListener;

    async fn connect(&self, peer: &PeerId, service: Uuid) -> Result<Self::Stream> {
        let incoming = self
            .network
            .lock()
            .endpoints
            .get(&(peer.clone(), service))
            .map(|ep| ep.incoming.clone())
            .ok_or_else(|| anyhow!("No service {} listening on {}", service, peer))?;

        let (local_end, remote_end) = tokio::io::duplex(self.pipe_capacity);
        incoming
            .send(MemoryStream {
                inner: remote_end,
                peer: self.local.clone(),
            })
            .map_err(|_| anyhow!("Connection refused by {}", peer))?;

        debug!("[MEM] {} connected to {} ({})", self.local, peer, service);
        Ok(MemoryStream {
            inner: local_end,
            peer: peer.clone(),
        })
    }

    async fn listen(&self, service_name: &str, service: Uuid) -> Result<Self::Listener> {
        let key = (self.local.clone(), service);
        let mut state = self.network.lock();

        if let Some(existing) = state.endpoints.get(&key) {
            if !existing.incoming.is_closed() {
                return Err(anyhow!("Service {} already bound on {}", service, self.local));
            }
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(
            key.clone(),
            Endpoint {
                service_name: service_name.to_string(),
                generation,
                incoming: tx,
            },
        );
        drop(state);

        Ok(MemoryListener {
            incoming: rx,
            key,
            generation,
            network: self.network.clone(),
        })
    }

    async fn discover(&self, found: mpsc::UnboundedSender<DiscoveredPeer>) -> Result<()> {
        let peers: Vec<DiscoveredPeer> = {
            let state = self.network.lock();
            let mut seen = HashSet::new();
            state
                .endpoints
                .iter()
                .filter(|((node, _), _)| *node != self.local && seen.insert(node.clone()))
                .map(|((node, _), ep)| DiscoveredPeer {
                    peer: node.clone(),
                    name: Some(ep.service_name.clone()),
                })
                .collect()
        };

        for peer in peers {
            if found.send(peer).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcomm_shared::SAMPLE_SERVICE_UUID;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_reports_both_identities() {
        let network = MemoryNetwork::new();
        let server = network.transport("server");
        let client = network.transport("client");

        let mut listener = server.listen("svc", SAMPLE_SERVICE_UUID).await.unwrap();
        let mut outbound = client
            .connect(&PeerId::from("server"), SAMPLE_SERVICE_UUID)
            .await
            .unwrap();
        let mut inbound = listener.accept().await.unwrap();

        assert_eq!(outbound.peer(), PeerId::from("server"));
        assert_eq!(inbound.peer(), PeerId::from("client"));

        outbound.write_all(b"hi\n").await.unwrap();
        let mut buf = [0u8; 3];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let network = MemoryNetwork::new();
        let client = network.transport("client");
        let result = client
            .connect(&PeerId::from("nobody"), SAMPLE_SERVICE_UUID)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dropped_listener_unregisters() {
        let network = MemoryNetwork::new();
        let server = network.transport("server");

        let listener = server.listen("svc", SAMPLE_SERVICE_UUID).await.unwrap();
        assert_eq!(network.listening_endpoints(), 1);
        assert!(server.listen("svc", SAMPLE_SERVICE_UUID).await.is_err());

        drop(listener);
        assert_eq!(network.listening_endpoints(), 0);
        assert!(server.listen("svc", SAMPLE_SERVICE_UUID).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_drop_is_eof() {
        let network = MemoryNetwork::new();
        let server = network.transport("server");
        let client = network.transport("client");

        let mut listener = server.listen("svc", SAMPLE_SERVICE_UUID).await.unwrap();
        let outbound = client
            .connect(&PeerId::from("server"), SAMPLE_SERVICE_UUID)
            .await
            .unwrap();
        let mut inbound = listener.accept().await.unwrap();

        drop(outbound);
        let mut buf = [0u8; 8];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discover_lists_other_nodes_once() {
        let network = MemoryNetwork::new();
        let server = network.transport("server");
        let client = network.transport("client");

        let _a = server.listen("chat", SAMPLE_SERVICE_UUID).await.unwrap();
        let _b = server.listen("other", Uuid::from_u128(7)).await.unwrap();
        let _own = client.listen("mine", SAMPLE_SERVICE_UUID).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.discover(tx).await.unwrap();

        let found = rx.recv().await.unwrap();
        assert_eq!(found.peer, PeerId::from("server"));
        assert!(rx.recv().await.is_none());
    }
}
