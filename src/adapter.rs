//! Framework Adapter Port.
//!
//! The boundary to whatever UI toolkit hosts the components. The bridge only
//! ever calls these five operations; it never looks behind them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::{
    context::ExecutionContext,
    error::BridgeResult,
    registry::{
        ActionHandlers, ActionOutput, CapabilityFilter, CapabilityRegistry, ComponentDefinition,
        HandlerError, RegisterOptions,
    },
};

#[mockall::automock]
#[async_trait]
pub trait FrameworkAdapter: Send + Sync {
    async fn register_component(
        &self,
        definition: ComponentDefinition,
        handlers: ActionHandlers,
    ) -> BridgeResult<()>;

    async fn unregister_component(&self, id: &str) -> BridgeResult<()>;

    /// Notifies the UI layer of a state patch that has already been merged.
    async fn update_component_state(&self, id: &str, patch: Map<String, Value>) -> BridgeResult<()>;

    async fn execute_component_action(
        &self,
        id: &str,
        action: &str,
        params: Value,
        context: &ExecutionContext,
    ) -> Result<ActionOutput, HandlerError>;

    async fn get_component_definitions(&self) -> Vec<ComponentDefinition>;
}

/// Adapter that runs the action handlers stored in the registry. Used when
/// the host has no toolkit binding of its own.
pub struct RegistryAdapter {
    registry: Arc<CapabilityRegistry>,
}

impl RegistryAdapter {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl FrameworkAdapter for RegistryAdapter {
    async fn register_component(
        &self,
        definition: ComponentDefinition,
        handlers: ActionHandlers,
    ) -> BridgeResult<()> {
        if self.registry.contains_component(&definition.id) {
            trace!("component {} already in registry", definition.id);
            return Ok(());
        }
        self.registry
            .register_component(definition, handlers, RegisterOptions::default())?;
        Ok(())
    }

    async fn unregister_component(&self, id: &str) -> BridgeResult<()> {
        if self.registry.contains_component(id) {
            self.registry.unregister_component(id)?;
        }
        Ok(())
    }

    async fn update_component_state(&self, id: &str, patch: Map<String, Value>) -> BridgeResult<()> {
        // The registry's state store already holds the merged state.
        debug!("component {} state updated ({} keys)", id, patch.len());
        Ok(())
    }

    async fn execute_component_action(
        &self,
        id: &str,
        action: &str,
        params: Value,
        context: &ExecutionContext,
    ) -> Result<ActionOutput, HandlerError> {
        let entry = self
            .registry
            .get_component(id)
            .ok_or_else(|| HandlerError::failed(format!("component not found: {}", id)))?;
        let handler = entry.handler(action).ok_or_else(|| {
            HandlerError::failed(format!("no handler for action {} on {}", action, id))
        })?;
        let state = self.registry.state().get(id).unwrap_or_default();
        handler.call(params, &state, context).await
    }

    async fn get_component_definitions(&self) -> Vec<ComponentDefinition> {
        self.registry.list_components(&CapabilityFilter::default())
    }
}
