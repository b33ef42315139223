pub mod catalog;
pub mod correlation;
pub mod message;

pub use catalog::{CapabilityCatalog, CapabilitySet};
pub use correlation::{CorrelationError, CorrelationResult, CorrelationTable, PendingResponse};
pub use message::{Envelope, MessageError};
