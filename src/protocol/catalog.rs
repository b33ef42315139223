use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::registry::{ComponentDefinition, FunctionDefinition};

/// A set of advertised capabilities, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub functions: Vec<FunctionDefinition>,
    pub components: Vec<ComponentDefinition>,
}

impl CapabilitySet {
    pub fn new(
        mut functions: Vec<FunctionDefinition>,
        mut components: Vec<ComponentDefinition>,
    ) -> Self {
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        components.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            functions,
            components,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.components.is_empty()
    }
}

/// Capabilities advertised by the remote peer, as learned from its
/// `register_capabilities` and `update_capabilities` messages.
#[derive(Debug, Default)]
pub struct CapabilityCatalog {
    functions: DashMap<String, FunctionDefinition>,
    components: DashMap<String, ComponentDefinition>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole advertised set.
    pub fn replace(&self, set: CapabilitySet) -> CapabilitySet {
        self.functions.clear();
        self.components.clear();
        self.merge(set)
    }

    /// Merges by key, last write wins. Returns the resulting snapshot.
    pub fn merge(&self, set: CapabilitySet) -> CapabilitySet {
        for function in set.functions {
            self.functions.insert(function.name.clone(), function);
        }
        for component in set.components {
            self.components.insert(component.id.clone(), component);
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> CapabilitySet {
        CapabilitySet::new(
            self.functions.iter().map(|e| e.value().clone()).collect(),
            self.components.iter().map(|e| e.value().clone()).collect(),
        )
    }

    pub fn function(&self, name: &str) -> Option<FunctionDefinition> {
        self.functions.get(name).map(|e| e.clone())
    }

    pub fn component(&self, id: &str) -> Option<ComponentDefinition> {
        self.components.get(id).map(|e| e.clone())
    }

    pub fn clear(&self) {
        self.functions.clear();
        self.components.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(functions: &[(&str, &str)], components: &[&str]) -> CapabilitySet {
        CapabilitySet::new(
            functions
                .iter()
                .map(|(name, desc)| FunctionDefinition::new(name, desc))
                .collect(),
            components
                .iter()
                .map(|id| ComponentDefinition::new(id, "button"))
                .collect(),
        )
    }

    #[test]
    fn test_replace_drops_previous() {
        let catalog = CapabilityCatalog::new();
        catalog.replace(set(&[("a", ""), ("b", "")], &["x"]));
        let snapshot = catalog.replace(set(&[("c", "")], &[]));
        assert_eq!(snapshot, set(&[("c", "")], &[]));
    }

    #[test]
    fn test_merge_last_write_wins() {
        let catalog = CapabilityCatalog::new();
        catalog.replace(set(&[("a", "old"), ("b", "")], &["x"]));
        let snapshot = catalog.merge(set(&[("a", "new")], &["y"]));
        assert_eq!(snapshot.functions.len(), 2);
        assert_eq!(catalog.function("a").unwrap().description, "new");
        assert!(catalog.component("x").is_some());
        assert!(catalog.component("y").is_some());
    }

    #[test]
    fn test_snapshot_sorted() {
        let catalog = CapabilityCatalog::new();
        catalog.merge(set(&[("zeta", ""), ("alpha", ""), ("mid", "")], &[]));
        let names: Vec<_> = catalog
            .snapshot()
            .functions
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
