//! Transport Port.
//!
//! A duplex text-frame channel. Concrete transports (pub/sub topics, sockets)
//! live outside this crate; [`memory`] provides an in-process one.
//!
//! Only the [`ConnectionManager`](crate::connection::ConnectionManager) calls
//! `connect`, `send` and `close`.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryPeer, MemoryTransport};

/// Invoked once per inbound frame.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Invoked when the remote side or the channel itself closes the connection.
/// A local [`Transport::close`] does not invoke it.
pub type CloseHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

#[mockall::automock]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;

    /// Fire-and-forget send of one frame.
    async fn send(&self, frame: String) -> TransportResult<()>;

    fn on_message(&self, handler: MessageHandler);

    fn on_close(&self, handler: CloseHandler);

    async fn close(&self) -> TransportResult<()>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("transport not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;
