//! Individual peer session handling

use crate::transport::BoxedStream;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btcomm_shared::codec::{self, LineDecoder};
use btcomm_shared::PeerId;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique id of a session within one communicator
pub type SessionId = u64;

/// Receiver of everything a session's reader produces
#[async_trait]
pub trait SessionEvents: Send + Sync + 'static {
    /// A complete line arrived from `peer`
    fn on_receive_line(&self, line: String, peer: &PeerId);

    /// The stream failed or hit end of stream. Called at most once per
    /// session and never after [`Session::cancel`].
    async fn on_lose_connection(&self, peer: &PeerId, session: SessionId);
}

/// Reader tuning
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub read_buffer_size: usize,
    pub max_line_length: Option<usize>,
}

struct SessionState {
    cancelled: AtomicBool,
    /// Wakes the reader and every in-flight write on cancel
    shutdown: CancellationToken,
}

/// Active connection to one peer
pub struct Session {
    id: SessionId,
    peer: PeerId,
    /// Taken and shut down on cancel
    writer: Arc<Mutex<Option<WriteHalf<BoxedStream>>>>,
    reader: std::sync::Mutex<Option<ReadHalf<BoxedStream>>>,
    state: Arc<SessionState>,
    connected_at: Instant,
}

impl Session {
    /// Wrap an established stream. Nothing is read until [`Session::start`].
    pub fn new(id: SessionId, stream: BoxedStream) -> Self {
        let peer = stream.peer();
        let (reader, writer) = tokio::io::split(stream);

        Self {
            id,
            peer,
            writer: Arc::new(Mutex::new(Some(writer))),
            reader: std::sync::Mutex::new(Some(reader)),
            state: Arc::new(SessionState {
                cancelled: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// True once [`Session::cancel`] has been called
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Launch the background reader. Lines and loss are reported to
    /// `events` for as long as it is alive. Starting twice is a no-op.
    pub fn start(&self, events: Weak<dyn SessionEvents>, options: ReaderOptions) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(reader) = reader else {
            warn!("[SESSION] Session #{} with {} already started", self.id, self.peer);
            return;
        };

        let task = ReadLoop {
            id: self.id,
            peer: self.peer.clone(),
            state: self.state.clone(),
            events,
            decoder: LineDecoder::with_max_line_length(options.max_line_length),
            read_buf: vec![0u8; options.read_buffer_size.max(1)],
        };
        tokio::spawn(task.run(reader));
    }

    /// Write `line` followed by the terminator and flush it.
    ///
    /// Fails as soon as the session is cancelled, including while blocked on
    /// a peer that has stopped reading.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let encoded: Bytes = codec::encode_line(line);
        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer
                .as_mut()
                .ok_or_else(|| anyhow!("Session with {} is closed", self.peer))?;
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            Ok::<(), anyhow::Error>(())
        };

        tokio::select! {
            biased;
            _ = self.state.shutdown.cancelled() => {
                Err(anyhow!("Session with {} is closed", self.peer))
            }
            result = write => result,
        }
    }

    /// Stop the reader and close the stream. Errors are ignored and repeated
    /// calls do nothing. The reader will not report a lost connection.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.shutdown.cancel();

        // A reader that was never started still holds its half of the stream
        drop(
            self.reader
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );

        // Blocked writes release the lock once they see the cancellation
        let writer = self.writer.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(mut writer) = writer.lock().await.take() {
                        let _ = writer.shutdown().await;
                    }
                });
            }
            Err(_) => {
                if let Ok(mut writer) = writer.try_lock() {
                    writer.take();
                }
            }
        }
        debug!("[SESSION] Cancelled session #{} with {}", self.id, self.peer);
    }
}

struct ReadLoop {
    id: SessionId,
    peer: PeerId,
    state: Arc<SessionState>,
    events: Weak<dyn SessionEvents>,
    decoder: LineDecoder,
    read_buf: Vec<u8>,
}

impl ReadLoop {
    async fn run(mut self, mut reader: ReadHalf<BoxedStream>) {
        let lost = self.read_lines(&mut reader).await;
        drop(reader);

        if !lost || self.state.cancelled.load(Ordering::SeqCst) {
            debug!("[SESSION] Reader for {} stopped", self.peer);
            return;
        }

        info!("[SESSION] Connection to {} lost", self.peer);
        if let Some(events) = self.events.upgrade() {
            events.on_lose_connection(&self.peer, self.id).await;
        }
    }

    /// Returns true if the stream failed or ended, false if stopped on purpose
    async fn read_lines(&mut self, reader: &mut ReadHalf<BoxedStream>) -> bool {
        loop {
            if self.state.cancelled.load(Ordering::SeqCst) {
                return false;
            }

            let result = tokio::select! {
                biased;
                _ = self.state.shutdown.cancelled() => return false,
                result = reader.read(&mut self.read_buf) => result,
            };

            match result {
                Ok(0) => {
                    if let Some(tail) = self.decoder.finish() {
                        self.deliver(tail);
                    }
                    debug!("[SESSION] {} closed the stream", self.peer);
                    return true;
                }
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                    loop {
                        match self.decoder.decode_next() {
                            Ok(Some(line)) => {
                                if !self.deliver(line) {
                                    return false;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("[SESSION] Dropping {}: {}", self.peer, e);
                                return true;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("[SESSION] Read error from {}: {}", self.peer, e);
                    return true;
                }
            }
        }
    }

    /// Returns false once the owning communicator is gone
    fn deliver(&self, line: String) -> bool {
        match self.events.upgrade() {
            Some(events) => {
                events.on_receive_line(line, &self.peer);
                true
            }
            None => false,
        }
    }
}
