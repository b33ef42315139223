//! # Connection Lifecycle Manager
//!
//! Owns the [`Transport`] and hides its instability from the rest of the
//! bridge:
//!
//! - outbound frames are queued in order while not connected and flushed, in
//!   that order, as soon as the connection comes up and before any newer frame
//! - a keepalive `ping` runs while connected; a missing `pong` forces the
//!   connection down
//! - lost connections are re-established with exponential backoff
//!
//! State transitions are visible through [`ConnectionManager::subscribe_state`]
//! and as [`BridgeEvent::ConnectionStateChanged`] on the event bus.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError, Weak,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ConnectionConfig,
    event_bus::{BridgeEvent, EventBus},
    protocol::message::Envelope,
    transport::{Transport, TransportError},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("connect timed out after {after:?}")]
    ConnectTimeout { after: Duration },
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

#[derive(Debug)]
enum Lifecycle {
    Connect,
    /// `generation` names the connection that was lost; a newer one ignores it.
    Lost { reason: String, generation: u64 },
    Close,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    event_bus: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<bool>,
    queue: Mutex<VecDeque<String>>,
    lifecycle: mpsc::UnboundedSender<Lifecycle>,
    lifecycle_rx: StdMutex<Option<mpsc::UnboundedReceiver<Lifecycle>>>,
    inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    last_pong: StdMutex<Instant>,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (lifecycle, lifecycle_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        transport.on_message(Arc::new(move |frame| {
            // Receiver gone means the bridge is shutting down.
            let _ = inbound_tx.send(frame);
        }));
        let generation = Arc::new(AtomicU64::new(0));
        {
            let lifecycle = lifecycle.clone();
            let generation = generation.clone();
            transport.on_close(Arc::new(move |reason| {
                let _ = lifecycle.send(Lifecycle::Lost {
                    reason: reason.unwrap_or_else(|| "transport closed".to_string()),
                    generation: generation.load(Ordering::SeqCst),
                });
            }));
        }

        Arc::new(Self {
            transport,
            config,
            event_bus,
            state: watch::Sender::new(ConnectionState::Disconnected),
            closed: watch::Sender::new(false),
            queue: Mutex::new(VecDeque::new()),
            lifecycle,
            lifecycle_rx: StdMutex::new(Some(lifecycle_rx)),
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            last_pong: StdMutex::new(Instant::now()),
            keepalive: StdMutex::new(None),
            supervisor: StdMutex::new(None),
            started: AtomicBool::new(false),
            generation,
        })
    }

    /// Starts the supervisor and the first connect attempt. Later calls do
    /// nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(events) = lock(&self.lifecycle_rx).take() else {
            return;
        };
        let handle = tokio::spawn(Self::supervise(Arc::downgrade(self), events));
        *lock(&self.supervisor) = Some(handle);
        let _ = self.lifecycle.send(Lifecycle::Connect);
    }

    /// Asks the supervisor to connect if currently disconnected. Used after
    /// automatic reconnection gave up or is disabled.
    pub fn reconnect(&self) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.lifecycle
            .send(Lifecycle::Connect)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Frames received from the transport. Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        lock(&self.inbound_rx).take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Sends now if connected and nothing is waiting ahead of this frame,
    /// queues it otherwise. A failed send keeps the frame and drops the
    /// connection, so the reconnect flushes it.
    #[instrument(level = "trace", skip(self, frame))]
    pub async fn send(&self, frame: String) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut queue = self.queue.lock().await;
        let mut failed = false;
        if self.state() == ConnectionState::Connected && queue.is_empty() {
            match self.transport.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("send failed, queueing frame: {}", e);
                    failed = true;
                }
            }
        }
        if queue.len() >= self.config.max_queue_size {
            return Err(ConnectionError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        queue.push_back(frame);
        drop(queue);
        if failed {
            self.force_disconnect("send failed").await;
        }
        Ok(())
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> crate::BridgeResult<()> {
        let frame = envelope.encode()?;
        self.send(frame).await?;
        Ok(())
    }

    /// Marks a `pong` as received; keeps the keepalive from tearing the
    /// connection down.
    pub fn record_pong(&self) {
        *lock(&self.last_pong) = Instant::now();
    }

    /// Terminal: disconnects, stops reconnecting and rejects further sends.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.stop_keepalive();
        let _ = self.lifecycle.send(Lifecycle::Close);
        self.close_transport().await;
        let dropped = {
            let mut queue = self.queue.lock().await;
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            warn!("dropped {} queued frames on close", dropped);
        }
        self.set_state(ConnectionState::Disconnected);
        info!("connection closed");
    }

    async fn supervise(this: Weak<Self>, mut events: mpsc::UnboundedReceiver<Lifecycle>) {
        while let Some(event) = events.recv().await {
            let Some(manager) = this.upgrade() else {
                break;
            };
            match event {
                Lifecycle::Connect => {
                    if manager.state() == ConnectionState::Disconnected {
                        manager.establish().await;
                    }
                }
                Lifecycle::Lost { reason, generation } => {
                    if manager.state() != ConnectionState::Connected
                        || generation != manager.generation.load(Ordering::SeqCst)
                    {
                        debug!("ignoring stale close: {}", reason);
                        continue;
                    }
                    warn!("connection lost: {}", reason);
                    manager.stop_keepalive();
                    manager.set_state(ConnectionState::Disconnected);
                    if manager.config.auto_reconnect {
                        manager.establish().await;
                    }
                }
                Lifecycle::Close => break,
            }
        }
        debug!("connection supervisor stopped");
    }

    /// Connect loop with backoff. Returns once connected, once retries are
    /// exhausted, or on close.
    async fn establish(self: &Arc<Self>) {
        let mut closed = self.closed.subscribe();
        let mut retries: u32 = 0;
        loop {
            if self.is_closed() {
                return;
            }
            self.set_state(ConnectionState::Connecting);
            match self.connect_once().await {
                Ok(()) if self.is_closed() => {
                    debug!("closed while connecting");
                    self.close_transport().await;
                    return;
                }
                Ok(()) => {
                    self.on_connected().await;
                    return;
                }
                Err(e) => warn!("connect attempt {} failed: {}", retries + 1, e),
            }
            self.set_state(ConnectionState::Disconnected);

            if !self.config.auto_reconnect {
                return;
            }
            if let Some(max) = self.config.max_reconnect_attempts {
                if retries >= max {
                    warn!("giving up after {} reconnect attempts", retries);
                    let _ = self
                        .event_bus
                        .publish(BridgeEvent::ReconnectFailed { attempts: retries });
                    return;
                }
            }

            let delay = self.config.backoff(retries);
            retries += 1;
            debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed.wait_for(|closed| *closed) => return,
            }
        }
    }

    async fn connect_once(&self) -> ConnectionResult<()> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.transport.connect()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::ConnectTimeout { after: timeout }),
        }
    }

    async fn on_connected(self: &Arc<Self>) {
        let flushed = {
            // Holding the queue lock keeps new sends behind the flush.
            let mut queue = self.queue.lock().await;
            if self.is_closed() {
                drop(queue);
                self.close_transport().await;
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectionState::Connected);
            let total = queue.len();
            let mut flushed = true;
            while let Some(frame) = queue.front().cloned() {
                if let Err(e) = self.transport.send(frame).await {
                    warn!("flush interrupted, {} frames left: {}", queue.len(), e);
                    flushed = false;
                    break;
                }
                queue.pop_front();
            }
            if total > 0 {
                debug!("flushed {} queued frames", total - queue.len());
            }
            flushed
        };
        if !flushed {
            self.force_disconnect("flush failed").await;
            return;
        }
        if self.is_closed() {
            return;
        }
        self.record_pong();
        self.start_keepalive();
        info!("connected");
    }

    fn start_keepalive(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let interval = self.config.ping_interval;
        let grace = self.config.pong_timeout;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = this.upgrade() else {
                    return;
                };
                if manager.state() != ConnectionState::Connected {
                    return;
                }
                let sent_at = Instant::now();
                if let Err(e) = manager.send_envelope(&Envelope::ping()).await {
                    debug!("keepalive ping not sent: {}", e);
                    continue;
                }
                drop(manager);

                tokio::time::sleep(grace).await;
                let Some(manager) = this.upgrade() else {
                    return;
                };
                if manager.state() != ConnectionState::Connected {
                    return;
                }
                if *lock(&manager.last_pong) < sent_at {
                    warn!("no pong within {:?}, dropping connection", grace);
                    manager.force_disconnect("keepalive timeout").await;
                    return;
                }
            }
        });
        if let Some(previous) = lock(&self.keepalive).replace(handle) {
            previous.abort();
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = lock(&self.keepalive).take() {
            handle.abort();
        }
    }

    async fn force_disconnect(&self, reason: &str) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.close_transport().await;
        let _ = self.lifecycle.send(Lifecycle::Lost {
            reason: reason.to_string(),
            generation,
        });
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.close().await {
            debug!("transport close: {}", e);
        }
    }

    fn set_state(&self, current: ConnectionState) {
        let previous = self.state.send_replace(current);
        if previous == current {
            return;
        }
        debug!("connection {} -> {}", previous, current);
        let _ = self
            .event_bus
            .publish(BridgeEvent::ConnectionStateChanged { previous, current });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_keepalive();
        if let Some(handle) = lock(&self.supervisor).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
