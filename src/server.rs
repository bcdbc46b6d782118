//! Server role: listening endpoint and the accept loop

use crate::communicator::{BluetoothCommunicator, CommunicatorConfig, DeliveryContext};
use crate::transport::{BoxedStream, Transport, TransportListener};
use btcomm_shared::PeerId;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Reported by the accept loop, on the delivery context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEvent {
    /// A peer connected and its session is registered
    Accepted(PeerId),
    /// The listening endpoint could not be opened; no loop was started
    Failed { reason: String },
}

/// Called for every listen event
pub type OnListen = Arc<dyn Fn(ListenEvent) + Send + Sync>;

/// Configuration for the accept loop
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Pause after a failed accept before trying again
    pub accept_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_retry_delay: Duration::from_millis(100),
        }
    }
}

struct AcceptLoop {
    task: JoinHandle<()>,
    stopped: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Accepts any number of inbound peers on one service.
///
/// Dereferences to [`BluetoothCommunicator`] for sending, disconnecting and
/// listener registration.
pub struct BluetoothServer<T: Transport> {
    communicator: BluetoothCommunicator,
    transport: Arc<T>,
    config: ServerConfig,
    accept_loop: Mutex<Option<AcceptLoop>>,
    /// Serialises start_listening so only one endpoint is ever opened at a time
    starting: tokio::sync::Mutex<()>,
}

impl<T: Transport> BluetoothServer<T> {
    pub fn new(transport: T, delivery: Arc<dyn DeliveryContext>) -> Self {
        Self::with_config(
            transport,
            delivery,
            CommunicatorConfig::default(),
            ServerConfig::default(),
        )
    }

    pub fn with_config(
        transport: T,
        delivery: Arc<dyn DeliveryContext>,
        communicator_config: CommunicatorConfig,
        config: ServerConfig,
    ) -> Self {
        Self {
            communicator: BluetoothCommunicator::with_config(delivery, communicator_config),
            transport: Arc::new(transport),
            config,
            accept_loop: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn communicator(&self) -> &BluetoothCommunicator {
        &self.communicator
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// True while an accept loop is running
    pub fn is_listening(&self) -> bool {
        self.accept_slot()
            .as_ref()
            .is_some_and(|accept| !accept.task.is_finished())
    }

    /// Open a listening endpoint for `(service_name, service)` and accept
    /// peers on a background task until [`BluetoothServer::stop_listening`].
    ///
    /// Does nothing if already listening. If the endpoint cannot be opened,
    /// `on_event` receives [`ListenEvent::Failed`] and no loop is started.
    pub async fn start_listening<F>(&self, service_name: &str, service: Uuid, on_event: F)
    where
        F: Fn(ListenEvent) + Send + Sync + 'static,
    {
        let _starting = self.starting.lock().await;
        if self.is_listening() {
            debug!("[SERVER] Already listening");
            return;
        }
        self.stop_listening();

        let on_event: OnListen = Arc::new(on_event);
        let listener = match self.transport.listen(service_name, service).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("[SERVER] Failed to listen as {}: {}", service_name, e);
                let event = ListenEvent::Failed {
                    reason: e.to_string(),
                };
                self.communicator.post(Box::new(move || on_event(event)));
                return;
            }
        };

        info!(
            "[SERVER] Listening as {} ({}) via {}",
            service_name,
            service,
            self.transport.name()
        );

        let stopped = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(accept_loop(
            listener,
            self.communicator.clone(),
            on_event,
            stopped.clone(),
            self.config.accept_retry_delay,
        ));
        *self.accept_slot() = Some(AcceptLoop { task, stopped });
    }

    /// Close the listening endpoint and end the accept loop. Established
    /// sessions are unaffected. Idempotent.
    pub fn stop_listening(&self) {
        if let Some(accept) = self.accept_slot().take() {
            accept.stop();
            info!("[SERVER] Stopped listening");
        }
    }

    fn accept_slot(&self) -> MutexGuard<'_, Option<AcceptLoop>> {
        self.accept_loop.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn accept_loop<L: TransportListener>(
    mut listener: L,
    communicator: BluetoothCommunicator,
    on_event: OnListen,
    stopped: Arc<AtomicBool>,
    retry_delay: Duration,
) {
    debug!("[SERVER] Waiting for connections...");

    loop {
        match listener.accept().await {
            Ok(stream) => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let stream: BoxedStream = Box::new(stream);
                let peer = communicator.register_session(stream).await;
                info!("[SERVER] Accepted connection from {}", peer);

                let on_event = on_event.clone();
                communicator.post(Box::new(move || on_event(ListenEvent::Accepted(peer))));
            }
            Err(e) => {
                // Transient; keep the endpoint open and try again
                debug!("[SERVER] Accept failed: {}", e);
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

impl<T: Transport> Deref for BluetoothServer<T> {
    type Target = BluetoothCommunicator;

    fn deref(&self) -> &Self::Target {
        &self.communicator
    }
}

impl<T: Transport> Drop for BluetoothServer<T> {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
