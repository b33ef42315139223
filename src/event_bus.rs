//! # Local Event Bus
//!
//! In-process broadcast hub used for everything the bridge wants to tell the
//! hosting application about: connection state transitions, capability catalog
//! changes, component state changes and registration activity.
//!
//! Observers call [`EventBus::subscribe`] and drop the returned receiver to
//! unsubscribe. The bus keeps an internal receiver so publishing never fails
//! just because nobody is listening yet.

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, trace};

use crate::{
    connection::ConnectionState, context::AgentInfo, protocol::catalog::CapabilitySet,
    registry::state::StateChange,
};

#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
pub enum BridgeEvent {
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// Reconnection stopped after exhausting the configured attempts.
    ReconnectFailed { attempts: u32 },
    CapabilitiesUpdated(CapabilitySet),
    ComponentStateChanged(StateChange),
    FunctionRegistered { name: String },
    FunctionUnregistered { name: String },
    ComponentRegistered { id: String },
    ComponentUnregistered { id: String },
    SessionStarted {
        session_id: String,
        agent: Option<AgentInfo>,
    },
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
    capacity: usize,
    _internal_receiver: broadcast::Receiver<BridgeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            _internal_receiver: receiver,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe())
    }

    /// Subscription as a `Stream`; lagged gaps are skipped silently.
    pub fn stream(&self) -> impl Stream<Item = BridgeEvent> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| event.ok())
    }

    pub fn publish(&self, event: BridgeEvent) -> EventResult<()> {
        debug_event("Publishing", &event);
        self.sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(())
    }

    pub fn subscribers_size(&self) -> usize {
        // The internal receiver is not an observer.
        self.sender.receiver_count().saturating_sub(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn debug_event(prefix: &str, event: &BridgeEvent) {
    match event {
        BridgeEvent::ComponentStateChanged(_) => trace!("{} Event: {:?}", prefix, event),
        _ => debug!("{} Event: {}", prefix, event.name()),
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BridgeEvent>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<BridgeEvent>) -> Self {
        Self { receiver }
    }

    /// Receives the next event. After a `Lagged` error the receiver has already
    /// skipped ahead, so the next call continues with fresh events.
    pub async fn recv(&mut self) -> EventResult<BridgeEvent> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(EventError::Lagged { count: n }),
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Waits for the first event accepted by `select`, skipping lag gaps.
    pub async fn recv_matching<T, F>(&mut self, mut select: F) -> EventResult<T>
    where
        F: FnMut(BridgeEvent) -> Option<T>,
    {
        loop {
            match self.recv().await {
                Ok(event) => {
                    if let Some(value) = select(event) {
                        return Ok(value);
                    }
                }
                Err(EventError::Lagged { count }) => {
                    debug!("event receiver lagged by {}", count);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event Send failed: {message}")]
    SendFailed { message: String },

    #[error("Event Receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("Event lagged: {count}")]
    Lagged { count: u64 },
}

pub type EventResult<T> = Result<T, EventError>;
