//! In-process transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Connection, FrameWriter, Inbound, InboundReader, Transport};
use crate::TransportError;

type InboundTx = mpsc::UnboundedSender<Result<Inbound, TransportError>>;

struct MemoryInner {
    sent: Mutex<Vec<Vec<u8>>>,
    sent_total: watch::Sender<usize>,
    send_stalled: watch::Sender<bool>,
    failing_sends: AtomicUsize,
    connect_error: Mutex<Option<String>>,
    connect_stalled: AtomicBool,
    connects: AtomicUsize,
    inbound: Mutex<Option<InboundTx>>,
    remote_closed: AtomicBool,
    closed: AtomicBool,
}

/// A transport that keeps every sent message in memory.
///
/// Clones share state, so a test keeps one handle to script failures and
/// inspect traffic while the pipeline owns another.
///
/// # Example
///
/// ```
/// use audio_uplink::net::MemoryTransport;
///
/// let transport = MemoryTransport::new();
/// let observer = transport.clone();
///
/// transport.fail_next_sends(2);
/// assert_eq!(observer.sent_count(), 0);
/// ```
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("sent", &self.sent_count())
            .field("connects", &self.connect_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Creates a transport that accepts every connection.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                sent: Mutex::new(Vec::new()),
                sent_total: watch::channel(0).0,
                send_stalled: watch::channel(false).0,
                failing_sends: AtomicUsize::new(0),
                connect_error: Mutex::new(None),
                connect_stalled: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                inbound: Mutex::new(None),
                remote_closed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every later `open` fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        *self.inner.connect_error.lock() = Some(reason.into());
    }

    /// Makes every later `open` hang.
    pub fn stall_connect(&self) {
        self.inner.connect_stalled.store(true, Ordering::SeqCst);
    }

    /// Makes the next `count` sends fail with an I/O error.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Suspends every send until [`resume_sends`](Self::resume_sends).
    pub fn stall_sends(&self) {
        self.inner.send_stalled.send_replace(true);
    }

    /// Lets stalled sends complete.
    pub fn resume_sends(&self) {
        self.inner.send_stalled.send_replace(false);
    }

    /// Delivers a text message to the open connection.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Ok(Inbound::Text(text.into())));
    }

    /// Closes the open connection from the remote side.
    pub fn close_remote(&self, reason: impl Into<String>) {
        self.inner.remote_closed.store(true, Ordering::SeqCst);
        self.push(Ok(Inbound::Close {
            reason: Some(reason.into()),
        }));
    }

    /// Breaks the open connection as a network failure would.
    pub fn break_connection(&self, reason: impl Into<String>) {
        self.inner.remote_closed.store(true, Ordering::SeqCst);
        self.push(Err(TransportError::Io(reason.into())));
    }

    /// Every payload sent so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().clone()
    }

    /// Every payload sent so far, decoded as little-endian 16-bit samples.
    pub fn sent_samples(&self) -> Vec<Vec<i16>> {
        self.inner
            .sent
            .lock()
            .iter()
            .map(|payload| {
                payload
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect()
            })
            .collect()
    }

    /// Number of payloads sent so far.
    pub fn sent_count(&self) -> usize {
        *self.inner.sent_total.borrow()
    }

    /// Waits until at least `count` payloads have been sent.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.inner.sent_total.subscribe();
        let _ = rx.wait_for(|total| *total >= count).await;
    }

    /// Number of connections opened.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Returns `true` once the local side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn push(&self, message: Result<Inbound, TransportError>) {
        match self.inner.inbound.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => tracing::debug!("MemoryTransport: no open connection, message dropped"),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        if self.inner.connect_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.inner.connect_error.lock().clone() {
            return Err(TransportError::Connect(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.inbound.lock() = Some(tx);
        self.inner.remote_closed.store(false, Ordering::SeqCst);
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("MemoryTransport: opened {}", endpoint);

        Ok(Connection {
            writer: Box::new(MemoryWriter {
                inner: Arc::clone(&self.inner),
            }),
            reader: Box::new(MemoryReader { rx }),
        })
    }
}

struct MemoryWriter {
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut gate = self.inner.send_stalled.subscribe();
        let _ = gate.wait_for(|stalled| !*stalled).await;

        if self.inner.remote_closed.load(Ordering::SeqCst) || self.inner.closed.load(Ordering::SeqCst)
        {
            return Err(TransportError::Closed);
        }
        let injected = self
            .inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::io("injected send failure"));
        }

        self.inner.sent.lock().push(payload);
        self.inner.sent_total.send_modify(|total| *total += 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.inbound.lock().take();
        Ok(())
    }
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl InboundReader for MemoryReader {
    async fn next(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.rx.recv().await
    }
}
