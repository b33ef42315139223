//! In-process transport.
//!
//! [`MemoryTransport::new`] returns the transport plus a [`MemoryPeer`] that
//! plays the remote side: it reads what was sent, delivers frames, hangs up
//! and can make connects fail. [`MemoryTransport::pair`] links two transports
//! back to back so two bridges can talk to each other.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, PoisonError, RwLock, Weak,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use super::{CloseHandler, MessageHandler, Transport, TransportError, TransportResult};

struct Endpoint {
    connected: AtomicBool,
    connects: AtomicU32,
    failing_connects: AtomicU32,
    message_handler: RwLock<Option<MessageHandler>>,
    close_handler: RwLock<Option<CloseHandler>>,
    outbound: mpsc::UnboundedSender<String>,
    remote: RwLock<Option<Weak<Endpoint>>>,
}

impl Endpoint {
    fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
            message_handler: RwLock::new(None),
            close_handler: RwLock::new(None),
            outbound,
            remote: RwLock::new(None),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn deliver(&self, frame: String) -> bool {
        let handler = self
            .message_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) if self.is_connected() => {
                handler(frame);
                true
            }
            _ => {
                trace!("frame dropped, endpoint not listening");
                false
            }
        }
    }

    fn hang_up(&self, reason: Option<String>) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let handler = self
            .close_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(reason);
        }
    }

    fn remote(&self) -> Option<Arc<Endpoint>> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    endpoint: Arc<Endpoint>,
}

impl MemoryTransport {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MemoryTransport, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint::new(tx));
        (
            MemoryTransport {
                endpoint: endpoint.clone(),
            },
            MemoryPeer {
                endpoint,
                sent: Mutex::new(rx),
            },
        )
    }

    /// Two transports wired to each other. A frame sent on one is delivered to
    /// the other while both are connected.
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (left, _) = Self::new();
        let (right, _) = Self::new();
        *left
            .endpoint
            .remote
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&right.endpoint));
        *right
            .endpoint
            .remote
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&left.endpoint));
        (left, right)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.endpoint.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.endpoint.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.endpoint
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed(
                "memory peer refused".to_string(),
            ));
        }
        self.endpoint.connected.store(true, Ordering::SeqCst);
        debug!("memory transport connected");
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        if !self.endpoint.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match self.endpoint.remote() {
            Some(remote) => {
                remote.deliver(frame);
                Ok(())
            }
            None => self
                .endpoint
                .outbound
                .send(frame)
                .map_err(|e| TransportError::SendFailed(e.to_string())),
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        *self
            .endpoint
            .message_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        *self
            .endpoint
            .close_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn close(&self) -> TransportResult<()> {
        self.endpoint.connected.store(false, Ordering::SeqCst);
        if let Some(remote) = self.endpoint.remote() {
            remote.hang_up(Some("remote closed".to_string()));
        }
        Ok(())
    }
}

/// Remote side of a [`MemoryTransport`], for driving it from tests.
pub struct MemoryPeer {
    endpoint: Arc<Endpoint>,
    sent: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MemoryPeer {
    /// Next frame the transport sent, waiting for one if necessary.
    pub async fn next_frame(&self) -> Option<String> {
        self.sent.lock().await.recv().await
    }

    pub async fn try_next_frame(&self) -> Option<String> {
        self.sent.lock().await.try_recv().ok()
    }

    /// Delivers `frame` as if the remote side had sent it. Returns `false` if
    /// the transport is not connected or has no handler.
    pub fn deliver(&self, frame: &str) -> bool {
        self.endpoint.deliver(frame.to_string())
    }

    /// Drops the connection from the remote side, firing the close handler.
    pub fn hang_up(&self, reason: &str) {
        self.endpoint.hang_up(Some(reason.to_string()));
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.endpoint
            .failing_connects
            .store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.endpoint.connects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }
}
