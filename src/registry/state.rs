//! Runtime state of registered components.
//!
//! State is a JSON object per component, created empty on registration and
//! only ever changed through [`ComponentStateStore::merge`], a shallow merge.
//! Every merge is published on the event bus as a [`StateChange`].

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::event_bus::{BridgeEvent, EventBus, EventReceiver, EventResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StateSource {
    /// Local change made by the hosting application.
    Application,
    /// Remote `update_component` request.
    Agent,
    /// Patch returned by a component action.
    Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub component_id: String,
    pub patch: Map<String, Value>,
    pub state: Map<String, Value>,
    pub source: StateSource,
}

pub struct ComponentStateStore {
    states: DashMap<String, Map<String, Value>>,
    event_bus: Arc<EventBus>,
}

impl ComponentStateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            event_bus,
        }
    }

    pub(crate) fn create(&self, id: &str) {
        self.states.insert(id.to_string(), Map::new());
    }

    pub(crate) fn restore(&self, id: &str, state: Map<String, Value>) {
        self.states.insert(id.to_string(), state);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Map<String, Value>> {
        self.states.remove(id).map(|(_, state)| state)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Map<String, Value>> {
        self.states.get(id).map(|state| state.clone())
    }

    /// Shallow-merges `patch` into the component's state and returns the
    /// merged state, or `None` for an unknown component.
    pub fn merge(
        &self,
        id: &str,
        patch: Map<String, Value>,
        source: StateSource,
    ) -> Option<Map<String, Value>> {
        let merged = {
            let mut state = self.states.get_mut(id)?;
            for (key, value) in patch.iter() {
                state.insert(key.clone(), value.clone());
            }
            state.clone()
        };

        debug!("component {} state merged from {}", id, source);
        let change = StateChange {
            component_id: id.to_string(),
            patch,
            state: merged.clone(),
            source,
        };
        if let Err(e) = self.event_bus.publish(BridgeEvent::ComponentStateChanged(change)) {
            debug!("state change not published: {}", e);
        }
        Some(merged)
    }

    /// Every state change, for every component.
    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// State changes of one component.
    pub fn observe(&self, id: &str) -> StateObserver {
        StateObserver {
            component_id: id.to_string(),
            receiver: self.event_bus.subscribe(),
        }
    }
}

pub struct StateObserver {
    component_id: String,
    receiver: EventReceiver,
}

impl StateObserver {
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub async fn changed(&mut self) -> EventResult<StateChange> {
        let id = self.component_id.clone();
        self.receiver
            .recv_matching(move |event| match event {
                BridgeEvent::ComponentStateChanged(change) if change.component_id == id => {
                    Some(change)
                }
                _ => None,
            })
            .await
    }

    /// Like [`StateObserver::changed`] but yields `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<StateChange> {
        match self.changed().await {
            Ok(change) => Some(change),
            Err(e) => {
                debug!("state observer closed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_merge_is_shallow() {
        let store = ComponentStateStore::new(Arc::new(EventBus::new(16)));
        store.create("form");
        store.merge("form", patch(json!({"a": 1, "nested": {"x": 1}})), StateSource::Application);
        let merged = store
            .merge("form", patch(json!({"b": 2, "nested": {"y": 2}})), StateSource::Agent)
            .unwrap();
        assert_eq!(
            Value::Object(merged),
            json!({"a": 1, "b": 2, "nested": {"y": 2}})
        );
    }

    #[tokio::test]
    async fn test_merge_unknown_component() {
        let store = ComponentStateStore::new(Arc::new(EventBus::new(16)));
        assert!(store.merge("ghost", Map::new(), StateSource::Agent).is_none());
        assert!(store.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_observe_filters_by_component() {
        let store = ComponentStateStore::new(Arc::new(EventBus::new(16)));
        store.create("a");
        store.create("b");
        let mut observer = store.observe("b");

        store.merge("a", patch(json!({"v": 1})), StateSource::Application);
        store.merge("b", patch(json!({"v": 2})), StateSource::Action);

        let change = observer.changed().await.unwrap();
        assert_eq!(change.component_id, "b");
        assert_eq!(change.source, StateSource::Action);
        assert_eq!(Value::Object(change.state), json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_remove_drops_state() {
        let store = ComponentStateStore::new(Arc::new(EventBus::new(16)));
        store.create("a");
        store.merge("a", patch(json!({"v": 1})), StateSource::Application);
        assert_eq!(store.remove("a").unwrap()["v"], json!(1));
        assert!(!store.contains("a"));
    }
}
