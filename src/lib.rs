//! # AgentBridge: exposing application capabilities to AI agents
//!
//! AgentBridge lets an application publish named, schema-described functions
//! and stateful UI components that a remote agent can discover and invoke
//! over a message transport.
//!
//! ## Building Blocks
//!
//! ### 1. Capability Registry
//! Functions and components are registered with their definitions and
//! handlers ([`registry`]). Component state lives in a per-component store
//! and every change is published on the [`event_bus`].
//!
//! ### 2. Invocation Pipeline
//! Every call, local or remote, runs the same steps ([`pipeline`]):
//!
//! ```text
//! lookup -> context -> authorize -> validate -> rate limit -> execute -> CallResult
//! ```
//!
//! Parameters are checked against a [`schema::Schema`]; the caller's context
//! is normalized by [`context::ContextBuilder`].
//!
//! ### 3. Protocol
//! Typed JSON envelopes, request/response correlation and the catalog of
//! the peer's advertised capabilities ([`protocol`]).
//!
//! ### 4. Connection Lifecycle
//! The [`connection::ConnectionManager`] owns a [`transport::Transport`],
//! queues outbound frames while disconnected, reconnects with exponential
//! backoff and detects dead peers with ping/pong keepalive.
//!
//! ### 5. Framework Adapter
//! UI toolkits plug in through [`adapter::FrameworkAdapter`]. The default
//! [`adapter::RegistryAdapter`] runs handlers straight from the registry.
//!
//! ## Putting It Together
//!
//! [`bridge::AgentBridge`] wires all of the above into one explicitly owned
//! instance with a `build -> start -> shutdown` lifecycle.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod event_bus;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod timestamp;
pub mod transport;

// Re-exports
pub use bridge::{AgentBridge, AgentBridgeBuilder, BridgeStatus};
pub use config::BridgeConfig;
pub use error::*;
pub use pipeline::{CallError, CallMeta, CallResult, ErrorCode, Target};
