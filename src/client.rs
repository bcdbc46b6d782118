//! Client role: peer discovery and the outbound connect workflow

use crate::communicator::{BluetoothCommunicator, CommunicatorConfig, DeliveryContext};
use crate::transport::{BoxedStream, DiscoveredPeer, Transport};
use btcomm_shared::PeerId;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeeded(PeerId),
    Failed { peer: PeerId, reason: String },
}

impl ConnectOutcome {
    pub fn peer(&self) -> &PeerId {
        match self {
            ConnectOutcome::Succeeded(peer) => peer,
            ConnectOutcome::Failed { peer, .. } => peer,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectOutcome::Succeeded(_))
    }
}

/// Connects out to a single peer at a time.
///
/// Dereferences to [`BluetoothCommunicator`] for sending, disconnecting and
/// listener registration.
pub struct BluetoothClient<T: Transport> {
    communicator: BluetoothCommunicator,
    transport: Arc<T>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    /// Peer of the attempt currently in flight
    pending: Arc<Mutex<Option<PeerId>>>,
}

impl<T: Transport> BluetoothClient<T> {
    pub fn new(transport: T, delivery: Arc<dyn DeliveryContext>) -> Self {
        Self::with_config(transport, delivery, CommunicatorConfig::default())
    }

    pub fn with_config(
        transport: T,
        delivery: Arc<dyn DeliveryContext>,
        config: CommunicatorConfig,
    ) -> Self {
        Self {
            communicator: BluetoothCommunicator::with_config(delivery, config),
            transport: Arc::new(transport),
            discovery: Mutex::new(None),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn communicator(&self) -> &BluetoothCommunicator {
        &self.communicator
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect to `peer`, matching the remote service by `service`.
    ///
    /// Reports success straight away if already connected to `peer`, and
    /// failure if connected to anyone else or if another attempt is still in
    /// flight. Otherwise discovery is cancelled and the attempt runs on a
    /// background task. `on_result` is always invoked exactly once, on the
    /// delivery context.
    pub async fn connect_to<F>(&self, peer: PeerId, service: Uuid, on_result: F)
    where
        F: FnOnce(ConnectOutcome) + Send + 'static,
    {
        if self.communicator.is_connected_to(&peer).await {
            debug!("[CLIENT] Already connected to {}", peer);
            let outcome = ConnectOutcome::Succeeded(peer);
            self.communicator.post(Box::new(move || on_result(outcome)));
            return;
        }

        if self.communicator.connection_count().await > 0 {
            let outcome = ConnectOutcome::Failed {
                reason: format!("Already connected to another peer, cannot connect to {}", peer),
                peer,
            };
            self.communicator.post(Box::new(move || on_result(outcome)));
            return;
        }

        {
            let mut pending = lock(&self.pending);
            if let Some(in_flight) = pending.as_ref() {
                let outcome = ConnectOutcome::Failed {
                    reason: format!("Connection to {} already in progress", in_flight),
                    peer,
                };
                drop(pending);
                self.communicator.post(Box::new(move || on_result(outcome)));
                return;
            }
            *pending = Some(peer.clone());
        }

        self.cancel_discovery();

        let transport = self.transport.clone();
        let communicator = self.communicator.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            info!("[CLIENT] Connecting to {} via {}", peer, transport.name());
            let outcome = match transport.connect(&peer, service).await {
                Ok(stream) => {
                    let stream: BoxedStream = Box::new(stream);
                    ConnectOutcome::Succeeded(communicator.register_session(stream).await)
                }
                Err(e) => {
                    warn!("[CLIENT] Connection to {} failed: {}", peer, e);
                    ConnectOutcome::Failed {
                        peer,
                        reason: e.to_string(),
                    }
                }
            };
            // Registered (or failed) before the slot frees up
            lock(&pending).take();
            communicator.post(Box::new(move || on_result(outcome)));
        });
    }

    /// Start scanning for devices; each one found is passed to `on_found` on
    /// the delivery context. Restarts any scan already running.
    pub fn start_discovery<F>(&self, on_found: F)
    where
        F: Fn(DiscoveredPeer) + Send + Sync + 'static,
    {
        self.cancel_discovery();

        let transport = self.transport.clone();
        let communicator = self.communicator.clone();
        let on_found = Arc::new(on_found);
        let (found_tx, mut found_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let scan = transport.discover(found_tx);
            let forward = async {
                while let Some(found) = found_rx.recv().await {
                    let on_found = on_found.clone();
                    communicator.post(Box::new(move || on_found(found)));
                }
            };

            let (result, ()) = tokio::join!(scan, forward);
            if let Err(e) = result {
                warn!("[CLIENT] Discovery failed: {}", e);
            }
        });

        *self.discovery_slot() = Some(handle);
    }

    /// Stop a running scan, if any
    pub fn cancel_discovery(&self) {
        if let Some(handle) = self.discovery_slot().take() {
            handle.abort();
            debug!("[CLIENT] Discovery cancelled");
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery_slot()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn discovery_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        lock(&self.discovery)
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(feature = "rfcomm")]
impl BluetoothClient<crate::transport::RfcommTransport> {
    /// Devices already paired with the local adapter
    pub async fn paired_devices(&self) -> anyhow::Result<Vec<DiscoveredPeer>> {
        crate::adapter::BluetoothAdapter::from_adapter(self.transport.adapter().clone())
            .paired_devices()
            .await
    }
}

impl<T: Transport> Deref for BluetoothClient<T> {
    type Target = BluetoothCommunicator;

    fn deref(&self) -> &Self::Target {
        &self.communicator
    }
}

impl<T: Transport> Drop for BluetoothClient<T> {
    fn drop(&mut self) {
        self.cancel_discovery();
    }
}
