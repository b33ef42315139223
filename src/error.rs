use thiserror::Error;

use crate::connection::ConnectionError;
use crate::event_bus::EventError;
use crate::pipeline::result::ErrorCode;
use crate::protocol::{correlation::CorrelationError, message::MessageError};
use crate::registry::RegistryError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Bridge not initialized: {0}")]
    NotInitialized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        BridgeError::Internal(message.into())
    }

    /// The wire error code this error surfaces as when it ends up in a `CallResult`.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Registry(e) => e.code(),
            BridgeError::Correlation(e) => e.code(),
            BridgeError::Message(_) => ErrorCode::InvalidParameters,
            BridgeError::NotInitialized(_) => ErrorCode::NotInitialized,
            _ => ErrorCode::ExecutionError,
        }
    }
}
