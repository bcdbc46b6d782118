//! Communicator core: session registry, inbound dispatch and outbound sends

use super::delivery::{DeliveryContext, Job};
use crate::session::{ReaderOptions, Session, SessionEvents, SessionId};
use crate::transport::BoxedStream;
use async_trait::async_trait;
use btcomm_shared::PeerId;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Called with every line received, on the delivery context
pub type OnReceive = Arc<dyn Fn(String, PeerId) + Send + Sync>;
/// Called when a peer drops unexpectedly, on the delivery context
pub type OnLoseConnection = Arc<dyn Fn(PeerId) + Send + Sync>;
/// Called with the outcome of each send, on the delivery context
pub type OnSend = Arc<dyn Fn(SendOutcome) + Send + Sync>;

/// Result of sending one line to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Succeeded(PeerId),
    Failed { peer: PeerId, reason: String },
}

impl SendOutcome {
    pub fn peer(&self) -> &PeerId {
        match self {
            SendOutcome::Succeeded(peer) => peer,
            SendOutcome::Failed { peer, .. } => peer,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Succeeded(_))
    }
}

/// Configuration shared by every session of a communicator
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Bytes requested from the stream per read
    pub read_buffer_size: usize,
    /// Drop a peer whose pending line grows past this many bytes
    pub max_line_length: Option<usize>,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            max_line_length: None,
        }
    }
}

#[derive(Default, Clone)]
struct Listeners {
    on_receive: Option<OnReceive>,
    on_lose_connection: Option<OnLoseConnection>,
}

struct Shared {
    /// Map of peer -> active session
    sessions: RwLock<HashMap<PeerId, Arc<Session>>>,
    delivery: Arc<dyn DeliveryContext>,
    listeners: std::sync::RwLock<Listeners>,
    config: CommunicatorConfig,
    next_session_id: AtomicU64,
}

impl Shared {
    fn listeners(&self) -> Listeners {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SessionEvents for Shared {
    fn on_receive_line(&self, line: String, peer: &PeerId) {
        let Some(callback) = self.listeners().on_receive else {
            return;
        };
        let peer = peer.clone();
        self.delivery.post(Box::new(move || callback(line, peer)));
    }

    async fn on_lose_connection(&self, peer: &PeerId, session: SessionId) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let is_current = sessions
                .get(peer)
                .is_some_and(|current| current.id() == session && !current.is_cancelled());
            if is_current {
                sessions.remove(peer)
            } else {
                None
            }
        };

        if removed.is_none() {
            debug!("[COMM] Ignoring loss of stale session #{} with {}", session, peer);
            return;
        }

        warn!("[COMM] Lost connection to {}", peer);
        if let Some(callback) = self.listeners().on_lose_connection {
            let peer = peer.clone();
            self.delivery.post(Box::new(move || callback(peer)));
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for session in self.sessions.get_mut().values() {
            session.cancel();
        }
    }
}

/// Registry of active sessions shared by the client and server roles.
///
/// Cloning yields another handle to the same registry. All sessions are
/// cancelled silently once the last handle is dropped.
#[derive(Clone)]
pub struct BluetoothCommunicator {
    shared: Arc<Shared>,
}

impl BluetoothCommunicator {
    /// Create a communicator posting callbacks to `delivery`
    pub fn new(delivery: Arc<dyn DeliveryContext>) -> Self {
        Self::with_config(delivery, CommunicatorConfig::default())
    }

    pub fn with_config(delivery: Arc<dyn DeliveryContext>, config: CommunicatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: RwLock::new(HashMap::new()),
                delivery,
                listeners: std::sync::RwLock::new(Listeners::default()),
                config,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Set the callback for received lines, replacing any previous one
    pub fn set_on_receive<F>(&self, callback: F)
    where
        F: Fn(String, PeerId) + Send + Sync + 'static,
    {
        self.update_listeners(|l| l.on_receive = Some(Arc::new(callback)));
    }

    /// Set the callback for unexpected connection loss
    pub fn set_on_lose_connection<F>(&self, callback: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.update_listeners(|l| l.on_lose_connection = Some(Arc::new(callback)));
    }

    fn update_listeners(&self, update: impl FnOnce(&mut Listeners)) {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner());
        update(&mut listeners);
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.shared.config
    }

    /// Run `job` on the delivery context
    pub fn post(&self, job: Job) {
        self.shared.delivery.post(job);
    }

    /// Snapshot of connected peers
    pub async fn connected_peers(&self) -> HashSet<PeerId> {
        self.shared.sessions.read().await.keys().cloned().collect()
    }

    pub async fn is_connected_to(&self, peer: &PeerId) -> bool {
        self.shared.sessions.read().await.contains_key(peer)
    }

    /// Get the number of connected peers
    pub async fn connection_count(&self) -> usize {
        self.shared.sessions.read().await.len()
    }

    /// Get the session for a specific peer
    pub async fn session(&self, peer: &PeerId) -> Option<Arc<Session>> {
        self.shared.sessions.read().await.get(peer).cloned()
    }

    /// Send a line to one peer.
    ///
    /// The outcome is returned and, if `on_result` is given, also posted to
    /// the delivery context. An unknown peer is a failure with no side effects.
    pub async fn send_line(
        &self,
        line: &str,
        peer: &PeerId,
        on_result: Option<OnSend>,
    ) -> SendOutcome {
        let outcome = match self.session(peer).await {
            Some(session) => write_to(&session, line).await,
            None => SendOutcome::Failed {
                peer: peer.clone(),
                reason: format!("Not connected to {}", peer),
            },
        };
        self.report(&outcome, on_result.as_ref());
        outcome
    }

    /// Send a line to every connected peer.
    ///
    /// Each peer is written independently; one failure does not stop the
    /// others and every outcome is reported on its own.
    pub async fn send_line_to_all(
        &self,
        line: &str,
        on_result: Option<OnSend>,
    ) -> Vec<SendOutcome> {
        let sessions: Vec<Arc<Session>> =
            self.shared.sessions.read().await.values().cloned().collect();

        let outcomes = join_all(sessions.iter().map(|session| write_to(session, line))).await;
        for outcome in &outcomes {
            self.report(outcome, on_result.as_ref());
        }
        outcomes
    }

    fn report(&self, outcome: &SendOutcome, on_result: Option<&OnSend>) {
        if let Some(callback) = on_result {
            let callback = callback.clone();
            let outcome = outcome.clone();
            self.post(Box::new(move || callback(outcome)));
        }
    }

    /// Close the session with `peer` without raising a lost-connection
    /// callback. Returns whether a session existed.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let mut sessions = self.shared.sessions.write().await;
        match sessions.remove(peer) {
            Some(session) => {
                session.cancel();
                info!("[COMM] Disconnected from {}", peer);
                true
            }
            None => false,
        }
    }

    /// Close every session silently; returns how many were closed
    pub async fn disconnect_all(&self) -> usize {
        let mut sessions = self.shared.sessions.write().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.cancel();
        }
        if count > 0 {
            info!("[COMM] Disconnected from {} peer(s)", count);
        }
        count
    }

    /// Register an established stream as the session for its peer and start
    /// reading from it. A previous session for the same peer is replaced and
    /// closed silently.
    pub async fn register_session(&self, stream: BoxedStream) -> PeerId {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(id, stream));
        let peer = session.peer().clone();

        let displaced = {
            let mut sessions = self.shared.sessions.write().await;
            let displaced = sessions.insert(peer.clone(), session.clone());
            if let Some(old) = &displaced {
                old.cancel();
            }
            displaced
        };
        if let Some(old) = displaced {
            warn!("[COMM] Replaced session #{} with {}", old.id(), peer);
        }

        let events: Weak<dyn SessionEvents> =
            Arc::downgrade(&self.shared) as Weak<dyn SessionEvents>;
        session.start(
            events,
            ReaderOptions {
                read_buffer_size: self.shared.config.read_buffer_size,
                max_line_length: self.shared.config.max_line_length,
            },
        );

        info!("[COMM] Session #{} established with {}", id, peer);
        peer
    }
}

async fn write_to(session: &Session, line: &str) -> SendOutcome {
    match session.write_line(line).await {
        Ok(()) => SendOutcome::Succeeded(session.peer().clone()),
        Err(e) => {
            warn!("[COMM] Failed to send to {}: {}", session.peer(), e);
            SendOutcome::Failed {
                peer: session.peer().clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::delivery::{delivery_queue, DeliveryLoop};
    use crate::transport::{
        MemoryNetwork, MemoryStream, MemoryTransport, Transport, TransportListener,
    };
    use btcomm_shared::SAMPLE_SERVICE_UUID;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Event {
        Line(String, PeerId),
        Lost(PeerId),
        Sent(SendOutcome),
    }

    struct Harness {
        communicator: BluetoothCommunicator,
        events: mpsc::UnboundedReceiver<Event>,
        tx: mpsc::UnboundedSender<Event>,
        local: MemoryTransport,
        network: MemoryNetwork,
    }

    impl Harness {
        fn new() -> Self {
            let (queue, looper) = delivery_queue();
            tokio::spawn(looper.run());
            let communicator = BluetoothCommunicator::new(Arc::new(queue));

            let (tx, events) = mpsc::unbounded_channel();
            let lines = tx.clone();
            communicator.set_on_receive(move |line, peer| {
                let _ = lines.send(Event::Line(line, peer));
            });
            let lost = tx.clone();
            communicator.set_on_lose_connection(move |peer| {
                let _ = lost.send(Event::Lost(peer));
            });

            let network = MemoryNetwork::new();
            let local = network.transport("local");
            Self {
                communicator,
                events,
                tx,
                local,
                network,
            }
        }

        /// Connect a remote node to this communicator, returning the remote's
        /// end of the stream
        async fn attach(&self, remote_name: &str) -> MemoryStream {
            let mut listener = self.local.listen("svc", SAMPLE_SERVICE_UUID).await.unwrap();
            let remote = self.network.transport(remote_name);
            let remote_end = remote
                .connect(&PeerId::from("local"), SAMPLE_SERVICE_UUID)
                .await
                .unwrap();
            let local_end = listener.accept().await.unwrap();
            self.communicator.register_session(Box::new(local_end)).await;
            remote_end
        }

        fn on_send(&self) -> OnSend {
            let tx = self.tx.clone();
            Arc::new(move |outcome| {
                let _ = tx.send(Event::Sent(outcome));
            })
        }

        async fn next(&mut self) -> Option<Event> {
            timeout(Duration::from_secs(2), self.events.recv())
                .await
                .ok()
                .flatten()
        }

        async fn quiet(&mut self) -> bool {
            timeout(Duration::from_millis(150), self.events.recv())
                .await
                .is_err()
        }
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails_without_mutation() {
        let mut h = Harness::new();
        let ghost = PeerId::from("ghost");

        let outcome = h.communicator.send_line("hello", &ghost, Some(h.on_send())).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.peer(), &ghost);

        match h.next().await {
            Some(Event::Sent(SendOutcome::Failed { peer, .. })) => assert_eq!(peer, ghost),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(h.communicator.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_lines_round_trip_in_order() {
        let mut h = Harness::new();
        let mut remote = h.attach("remote").await;
        let peer = PeerId::from("remote");
        assert!(h.communicator.is_connected_to(&peer).await);

        for line in ["one", "two", "thrée"] {
            let outcome = h.communicator.send_line(line, &peer, Some(h.on_send())).await;
            assert!(outcome.is_success());
        }
        let mut buf = vec![0u8; "one\ntwo\nthrée\n".len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, "one\ntwo\nthrée\n".as_bytes());

        for _ in 0..3 {
            assert_eq!(h.next().await, Some(Event::Sent(SendOutcome::Succeeded(peer.clone()))));
        }

        remote.write_all(b"a\nb\nc\n").await.unwrap();
        for expected in ["a", "b", "c"] {
            assert_eq!(h.next().await, Some(Event::Line(expected.into(), peer.clone())));
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_silent() {
        let mut h = Harness::new();
        let mut remote = h.attach("remote").await;
        let peer = PeerId::from("remote");

        assert!(h.communicator.disconnect(&peer).await);
        assert!(!h.communicator.is_connected_to(&peer).await);
        assert!(!h.communicator.disconnect(&peer).await);

        // Remote sees the close, local side reports nothing
        let mut buf = [0u8; 4];
        let n = timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(h.quiet().await);
    }

    #[tokio::test]
    async fn test_remote_close_reports_loss_once() {
        let mut h = Harness::new();
        let remote = h.attach("remote").await;
        let peer = PeerId::from("remote");

        drop(remote);
        assert_eq!(h.next().await, Some(Event::Lost(peer.clone())));
        assert!(h.quiet().await);
        assert!(!h.communicator.connected_peers().await.contains(&peer));
    }

    #[tokio::test]
    async fn test_send_to_all_reports_each_peer() {
        let mut h = Harness::new();
        let mut first = h.attach("first").await;
        let mut second = h.attach("second").await;

        let outcomes = h.communicator.send_line_to_all("hi all", Some(h.on_send())).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(SendOutcome::is_success));

        let mut reported = HashSet::new();
        for _ in 0..2 {
            match h.next().await {
                Some(Event::Sent(SendOutcome::Succeeded(peer))) => {
                    reported.insert(peer);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(reported, h.communicator.connected_peers().await);

        for remote in [&mut first, &mut second] {
            let mut buf = [0u8; 7];
            remote.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi all\n");
        }
    }

    #[tokio::test]
    async fn test_send_to_all_without_loss_listener() {
        let (queue, looper) = delivery_queue();
        tokio::spawn(looper.run());
        let communicator = BluetoothCommunicator::new(Arc::new(queue));

        let network = MemoryNetwork::new();
        let local = network.transport("local");
        let mut listener = local.listen("svc", SAMPLE_SERVICE_UUID).await.unwrap();
        let _remote = network
            .transport("remote")
            .connect(&PeerId::from("local"), SAMPLE_SERVICE_UUID)
            .await
            .unwrap();
        communicator
            .register_session(Box::new(listener.accept().await.unwrap()))
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        communicator
            .send_line_to_all(
                "x",
                Some(Arc::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .await;

        let outcome = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Succeeded(PeerId::from("remote")));
    }

    #[tokio::test]
    async fn test_register_replaces_existing_session_silently() {
        let mut h = Harness::new();
        let _old = h.attach("remote").await;
        let old_id = h.communicator.session(&PeerId::from("remote")).await.unwrap().id();

        let mut new_remote = h.attach("remote").await;
        let session = h.communicator.session(&PeerId::from("remote")).await.unwrap();
        assert_ne!(session.id(), old_id);
        assert_eq!(h.communicator.connection_count().await, 1);
        assert!(h.quiet().await, "displaced session must not report loss");

        h.communicator
            .send_line("to new", &PeerId::from("remote"), None)
            .await;
        let mut buf = [0u8; 7];
        new_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to new\n");
    }

    #[tokio::test]
    async fn test_callbacks_wait_for_delivery_loop() {
        let (queue, mut looper): (_, DeliveryLoop) = delivery_queue();
        let communicator = BluetoothCommunicator::new(Arc::new(queue));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = communicator
            .send_line(
                "x",
                &PeerId::from("nobody"),
                Some(Arc::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .await;
        assert!(!outcome.is_success());
        assert!(rx.try_recv().is_err(), "callback must not run on the caller");

        assert_eq!(looper.run_pending(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_racing_remote_close_is_silent() {
        let mut h = Harness::new();
        let remote = h.attach("remote").await;
        let peer = PeerId::from("remote");

        let communicator = h.communicator.clone();
        let racer = peer.clone();
        let (disconnected, ()) = tokio::join!(
            async move { communicator.disconnect(&racer).await },
            async move { drop(remote) },
        );
        assert!(disconnected);
        assert!(h.quiet().await, "caller-initiated close must not report loss");
        assert!(!h.communicator.is_connected_to(&peer).await);
    }

    #[tokio::test]
    async fn test_stale_loss_leaves_current_session() {
        let mut h = Harness::new();
        let _old = h.attach("remote").await;
        let peer = PeerId::from("remote");
        let old_id = h.communicator.session(&peer).await.unwrap().id();
        let _new = h.attach("remote").await;
        let current = h.communicator.session(&peer).await.unwrap();

        // A late report from the displaced session
        h.communicator.shared.on_lose_connection(&peer, old_id).await;
        assert!(h.quiet().await);
        assert!(h.communicator.is_connected_to(&peer).await);

        // A report for a session already cancelled by disconnect
        current.cancel();
        h.communicator.shared.on_lose_connection(&peer, current.id()).await;
        assert!(h.quiet().await);
    }

    #[tokio::test]
    async fn test_write_error_reported_as_send_failure() {
        let mut h = Harness::new();
        let remote = h.attach("remote").await;
        let peer = PeerId::from("remote");

        // The reader has not yet seen the close, so the session is still registered
        drop(remote);
        let outcome = h.communicator.send_line("anyone?", &peer, Some(h.on_send())).await;
        match &outcome {
            SendOutcome::Failed { peer: failed, reason } => {
                assert_eq!(failed, &peer);
                assert!(!reason.starts_with("Not connected"), "got: {}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let mut saw_failure = false;
        while let Some(event) = h.next().await {
            match event {
                Event::Sent(reported) => {
                    assert_eq!(reported, outcome);
                    saw_failure = true;
                }
                Event::Lost(lost) => assert_eq!(lost, peer),
                other => panic!("unexpected event: {:?}", other),
            }
            if saw_failure && !h.communicator.is_connected_to(&peer).await {
                break;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let mut h = Harness::new();
        let _a = h.attach("a").await;
        let _b = h.attach("b").await;

        assert_eq!(h.communicator.disconnect_all().await, 2);
        assert!(h.communicator.connected_peers().await.is_empty());
        assert!(h.quiet().await);
    }
}
