//! # Capability Registry
//!
//! In-memory catalog of the functions and components an application exposes.
//! Keys are unique: registering under an existing name or id fails with
//! [`RegistryError::AlreadyRegistered`] unless [`RegisterOptions::force`] is
//! set, in which case the old entry is replaced and a warning is logged.
//!
//! The registry also owns the runtime state of its components
//! ([`ComponentStateStore`]) and publishes registration activity on the
//! event bus.

pub mod component;
pub mod function;
pub mod state;

use std::{collections::BTreeSet, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub use component::{
    fn_action, ActionDefinition, ActionHandler, ActionHandlers, ActionOutput, ComponentDefinition,
    ComponentEntry,
};
pub use function::{fn_handler, FunctionDefinition, FunctionEntry, FunctionHandler};
pub use state::{ComponentStateStore, StateChange, StateObserver, StateSource};

use crate::{
    event_bus::{BridgeEvent, EventBus},
    pipeline::result::ErrorCode,
};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AuthLevel {
    #[default]
    Public,
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CapabilityKind {
    Function,
    Component,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityFilter {
    pub auth_level: Option<AuthLevel>,
    pub tags: Option<BTreeSet<String>>,
}

impl CapabilityFilter {
    pub fn auth_level(auth_level: AuthLevel) -> Self {
        Self {
            auth_level: Some(auth_level),
            tags: None,
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            auth_level: None,
            tags: Some(tags.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, auth_level: AuthLevel, tags: &BTreeSet<String>) -> bool {
        if self.auth_level.is_some_and(|level| level != auth_level) {
            return false;
        }
        match &self.tags {
            Some(wanted) => wanted.iter().any(|tag| tags.contains(tag)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Replace an existing entry under the same key instead of failing.
    pub force: bool,
}

impl RegisterOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

/// Error returned by function and action handlers. The pipeline reports it to
/// the caller as `EXECUTION_ERROR` with the display text as message.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        HandlerError::InvalidInput(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("{kind} already registered: {key}")]
    AlreadyRegistered { kind: CapabilityKind, key: String },
    #[error("invalid {kind} definition: {message}")]
    InvalidDefinition {
        kind: CapabilityKind,
        message: String,
    },
    #[error("component {component_id} has a handler for undeclared action {action}")]
    UndeclaredAction {
        component_id: String,
        action: String,
    },
    #[error("{kind} not found: {key}")]
    NotFound { kind: CapabilityKind, key: String },
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::AlreadyRegistered { .. } => ErrorCode::AlreadyRegistered,
            RegistryError::InvalidDefinition { .. } | RegistryError::UndeclaredAction { .. } => {
                ErrorCode::InvalidParameters
            }
            RegistryError::NotFound {
                kind: CapabilityKind::Function,
                ..
            } => ErrorCode::FunctionNotFound,
            RegistryError::NotFound {
                kind: CapabilityKind::Component,
                ..
            } => ErrorCode::ComponentNotFound,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

pub struct CapabilityRegistry {
    functions: DashMap<String, FunctionEntry>,
    components: DashMap<String, ComponentEntry>,
    state: ComponentStateStore,
    event_bus: Arc<EventBus>,
}

impl CapabilityRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            functions: DashMap::new(),
            components: DashMap::new(),
            state: ComponentStateStore::new(event_bus.clone()),
            event_bus,
        }
    }

    pub fn register_function(
        &self,
        definition: FunctionDefinition,
        handler: Arc<dyn FunctionHandler>,
        options: RegisterOptions,
    ) -> RegistryResult<()> {
        if definition.name.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition {
                kind: CapabilityKind::Function,
                message: "name must not be empty".to_string(),
            });
        }
        if definition.rate_limit.is_some_and(|limit| limit.max_requests == 0) {
            return Err(RegistryError::InvalidDefinition {
                kind: CapabilityKind::Function,
                message: "rateLimit.maxRequests must be at least 1".to_string(),
            });
        }

        let name = definition.name.clone();
        // entry() holds the shard lock, so check-then-insert is atomic.
        match self.functions.entry(name.clone()) {
            Entry::Occupied(mut occupied) => {
                if !options.force {
                    return Err(RegistryError::AlreadyRegistered {
                        kind: CapabilityKind::Function,
                        key: name,
                    });
                }
                warn!("overwriting registered function: {}", name);
                occupied.insert(FunctionEntry::new(definition, handler));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(FunctionEntry::new(definition, handler));
            }
        }

        debug!("function registered: {}", name);
        self.publish(BridgeEvent::FunctionRegistered { name });
        Ok(())
    }

    pub fn unregister_function(&self, name: &str) -> RegistryResult<FunctionDefinition> {
        let (_, entry) = self
            .functions
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound {
                kind: CapabilityKind::Function,
                key: name.to_string(),
            })?;
        debug!("function unregistered: {}", name);
        self.publish(BridgeEvent::FunctionUnregistered {
            name: name.to_string(),
        });
        Ok(entry.definition)
    }

    pub fn register_component(
        &self,
        definition: ComponentDefinition,
        handlers: ActionHandlers,
        options: RegisterOptions,
    ) -> RegistryResult<()> {
        if definition.id.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition {
                kind: CapabilityKind::Component,
                message: "id must not be empty".to_string(),
            });
        }
        if let Some(action) = handlers
            .keys()
            .find(|action| !definition.actions.contains_key(*action))
        {
            return Err(RegistryError::UndeclaredAction {
                component_id: definition.id.clone(),
                action: action.clone(),
            });
        }

        let id = definition.id.clone();
        let entry = ComponentEntry::new(definition, handlers);
        match self.components.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !options.force {
                    return Err(RegistryError::AlreadyRegistered {
                        kind: CapabilityKind::Component,
                        key: id,
                    });
                }
                warn!("overwriting registered component: {}", id);
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        // A forced overwrite starts from fresh state too.
        self.state.create(&id);
        debug!("component registered: {}", id);
        self.publish(BridgeEvent::ComponentRegistered { id });
        Ok(())
    }

    pub fn unregister_component(&self, id: &str) -> RegistryResult<ComponentDefinition> {
        let (_, entry) = self
            .components
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound {
                kind: CapabilityKind::Component,
                key: id.to_string(),
            })?;
        self.state.remove(id);
        debug!("component unregistered: {}", id);
        self.publish(BridgeEvent::ComponentUnregistered { id: id.to_string() });
        Ok(entry.definition)
    }

    /// Puts back an entry and state captured before a forced overwrite.
    pub(crate) fn restore_component(&self, entry: ComponentEntry, state: Map<String, Value>) {
        let id = entry.definition.id.clone();
        self.components.insert(id.clone(), entry);
        self.state.restore(&id, state);
        debug!("component restored: {}", id);
        self.publish(BridgeEvent::ComponentRegistered { id });
    }

    pub fn get_function(&self, name: &str) -> Option<FunctionEntry> {
        self.functions.get(name).map(|entry| entry.clone())
    }

    pub fn get_component(&self, id: &str) -> Option<ComponentEntry> {
        self.components.get(id).map(|entry| entry.clone())
    }

    pub fn contains_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn contains_component(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    /// Function definitions accepted by `filter`, sorted by name.
    pub fn list_functions(&self, filter: &CapabilityFilter) -> Vec<FunctionDefinition> {
        let mut definitions: Vec<_> = self
            .functions
            .iter()
            .filter(|entry| filter.matches(entry.definition.auth_level, &entry.definition.tags))
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Component definitions accepted by `filter`, sorted by id.
    pub fn list_components(&self, filter: &CapabilityFilter) -> Vec<ComponentDefinition> {
        let mut definitions: Vec<_> = self
            .components
            .iter()
            .filter(|entry| filter.matches(entry.definition.auth_level, &entry.definition.tags))
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn state(&self) -> &ComponentStateStore {
        &self.state
    }

    fn publish(&self, event: BridgeEvent) {
        if let Err(e) = self.event_bus.publish(event) {
            debug!("registry event not published: {}", e);
        }
    }
}
