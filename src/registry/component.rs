use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{context::ExecutionContext, schema::Schema};

use super::{AuthLevel, HandlerError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameter_schema: Schema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub id: String,
    pub component_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties_schema: Schema,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDefinition>,
    #[serde(default)]
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ComponentDefinition {
    pub fn new(id: &str, component_type: &str) -> Self {
        Self {
            id: id.to_string(),
            component_type: component_type.to_string(),
            description: String::new(),
            properties_schema: Schema::Any,
            actions: BTreeMap::new(),
            auth_level: AuthLevel::Public,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_properties(mut self, schema: Schema) -> Self {
        self.properties_schema = schema;
        self
    }

    pub fn with_action(mut self, name: &str, description: &str, parameter_schema: Schema) -> Self {
        self.actions.insert(
            name.to_string(),
            ActionDefinition {
                description: description.to_string(),
                parameter_schema,
            },
        );
        self
    }

    pub fn with_auth_level(mut self, auth_level: AuthLevel) -> Self {
        self.auth_level = auth_level;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.get(name)
    }
}

/// What an action hands back: the call's result data, plus an optional patch
/// to shallow-merge into the component's runtime state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub data: Value,
    pub state: Option<Map<String, Value>>,
}

impl ActionOutput {
    pub fn data(data: Value) -> Self {
        Self { data, state: None }
    }

    pub fn with_state(mut self, patch: Map<String, Value>) -> Self {
        self.state = Some(patch);
        self
    }
}

#[mockall::automock]
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `state` is a snapshot of the component's runtime state at call time.
    async fn call(
        &self,
        params: Value,
        state: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<ActionOutput, HandlerError>;
}

pub type ActionHandlers = HashMap<String, Arc<dyn ActionHandler>>;

type BoxedAction = Box<
    dyn Fn(
            Value,
            Map<String, Value>,
            ExecutionContext,
        ) -> Pin<Box<dyn Future<Output = Result<ActionOutput, HandlerError>> + Send>>
        + Send
        + Sync,
>;

pub struct FnAction {
    call: BoxedAction,
}

#[async_trait]
impl ActionHandler for FnAction {
    async fn call(
        &self,
        params: Value,
        state: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<ActionOutput, HandlerError> {
        (self.call)(params, state.clone(), context.clone()).await
    }
}

pub fn fn_action<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Value, Map<String, Value>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, HandlerError>> + Send + 'static,
{
    Arc::new(FnAction {
        call: Box::new(move |params, state, context| Box::pin(f(params, state, context))),
    })
}

#[derive(Clone)]
pub struct ComponentEntry {
    pub definition: ComponentDefinition,
    pub handlers: ActionHandlers,
    actions: Arc<Mutex<()>>,
}

impl ComponentEntry {
    pub fn new(definition: ComponentDefinition, handlers: ActionHandlers) -> Self {
        Self {
            definition,
            handlers,
            actions: Arc::new(Mutex::new(())),
        }
    }

    /// Serializes actions on this component. Held from the state snapshot
    /// through the merge of the action's patch, so concurrent actions see
    /// each other's updates. A handler must not invoke an action on its own
    /// component while it runs.
    pub async fn lock_actions(&self) -> OwnedMutexGuard<()> {
        self.actions.clone().lock_owned().await
    }

    pub fn handler(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action).cloned()
    }
}

impl std::fmt::Debug for ComponentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("ComponentEntry")
            .field("definition", &self.definition)
            .field("handlers", &handlers)
            .finish()
    }
}
