//! Capability Store - the opaque persistence boundary
//!
//! The gateway only depends on [`CapabilityStore`]; a production deployment
//! backs it with a relational + vector store. [`MemoryStore`] is the
//! reference implementation: DashMap-backed, safe for concurrent readers,
//! single-writer per id via the map's entry locks.

use dashmap::DashMap;

use crate::registry::capability::{Capability, CapabilityDependency, EdgeType};

/// Key/value + relational + vector persistence, seen through the one
/// interface the registry needs.
pub trait CapabilityStore: Send + Sync {
    fn get_by_id(&self, id: &str) -> Option<Capability>;
    fn get_by_name(&self, name: &str) -> Option<Capability>;

    /// Insert a new capability. Must not overwrite an existing id.
    fn insert(&self, capability: Capability);

    /// Apply `update` to the capability under its entry lock.
    fn update(&self, id: &str, update: &mut dyn FnMut(&mut Capability)) -> bool;

    /// Record (or re-observe) a dependency edge, single-writer per edge.
    fn record_edge(&self, from: &str, to: &str, edge_type: EdgeType);

    fn edges(&self) -> Vec<CapabilityDependency>;

    /// All capabilities, for candidate generation.
    fn all(&self) -> Vec<Capability>;

    fn len(&self) -> usize;
}

/// In-memory reference store.
#[derive(Default)]
pub struct MemoryStore {
    capabilities: DashMap<String, Capability>,
    /// name → id secondary index
    names: DashMap<String, String>,
    /// "from|to|type" → edge
    dependency_edges: DashMap<String, CapabilityDependency>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn edge_key(from: &str, to: &str, edge_type: EdgeType) -> String {
        format!("{}|{}|{}", from, to, edge_type.as_str())
    }
}

impl CapabilityStore for MemoryStore {
    fn get_by_id(&self, id: &str) -> Option<Capability> {
        self.capabilities.get(id).map(|c| c.value().clone())
    }

    fn get_by_name(&self, name: &str) -> Option<Capability> {
        let id = self.names.get(name)?.value().clone();
        self.get_by_id(&id)
    }

    fn insert(&self, capability: Capability) {
        if self.capabilities.contains_key(&capability.id) {
            return; // insertion-only per id
        }
        self.names
            .insert(capability.name.clone(), capability.id.clone());
        self.capabilities
            .insert(capability.id.clone(), capability);
    }

    fn update(&self, id: &str, update: &mut dyn FnMut(&mut Capability)) -> bool {
        let Some(mut entry) = self.capabilities.get_mut(id) else {
            return false;
        };
        let old_name = entry.name.clone();
        update(entry.value_mut());
        if entry.name != old_name {
            let new_name = entry.name.clone();
            drop(entry);
            self.names.remove(&old_name);
            self.names.insert(new_name, id.to_string());
        }
        true
    }

    fn record_edge(&self, from: &str, to: &str, edge_type: EdgeType) {
        let key = Self::edge_key(from, to, edge_type);
        self.dependency_edges
            .entry(key)
            .and_modify(CapabilityDependency::observe)
            .or_insert_with(|| CapabilityDependency::new(from, to, edge_type));
    }

    fn edges(&self) -> Vec<CapabilityDependency> {
        self.dependency_edges
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    fn all(&self) -> Vec<Capability> {
        self.capabilities.iter().map(|c| c.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.capabilities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn capability(id: &str, name: &str) -> Capability {
        Capability {
            id: id.to_string(),
            name: name.to_string(),
            code_template: "return 1;".to_string(),
            intent: "test".to_string(),
            intent_embedding: vec![0.0; 4],
            tools_used: vec![Arc::from("code:map")],
            success_rate: 1.0,
            usage_count: 1,
            created_at: Utc::now(),
            last_used: Utc::now(),
        }
    }

    #[test]
    fn insert_and_lookup() {
        let store = MemoryStore::new();
        store.insert(capability("aa11", "learned:exec_aa11"));

        assert!(store.get_by_id("aa11").is_some());
        assert!(store.get_by_name("learned:exec_aa11").is_some());
        assert!(store.get_by_id("zz99").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_does_not_overwrite_existing_id() {
        let store = MemoryStore::new();
        store.insert(capability("aa11", "learned:first"));

        let mut second = capability("aa11", "learned:second");
        second.code_template = "return 2;".to_string();
        store.insert(second);

        let kept = store.get_by_id("aa11").unwrap();
        assert_eq!(kept.name, "learned:first");
        assert_eq!(kept.code_template, "return 1;");
    }

    #[test]
    fn update_reindexes_renames() {
        let store = MemoryStore::new();
        store.insert(capability("aa11", "learned:old"));

        let updated = store.update("aa11", &mut |c| {
            c.name = "learned:fetch_report".to_string();
        });
        assert!(updated);
        assert!(store.get_by_name("learned:old").is_none());
        assert_eq!(
            store.get_by_name("learned:fetch_report").unwrap().id,
            "aa11"
        );
    }

    #[test]
    fn record_edge_increments_on_reobservation() {
        let store = MemoryStore::new();
        store.record_edge("a", "b", EdgeType::Sequence);
        store.record_edge("a", "b", EdgeType::Sequence);
        store.record_edge("a", "b", EdgeType::Contains);

        let edges = store.edges();
        assert_eq!(edges.len(), 2);
        let seq = edges
            .iter()
            .find(|e| e.edge_type == EdgeType::Sequence)
            .unwrap();
        assert_eq!(seq.observed_count, 2);
    }

    #[test]
    fn concurrent_updates_are_serialized_per_id() {
        use std::thread;

        let store = Arc::new(MemoryStore::new());
        store.insert(capability("aa11", "learned:x"));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.update("aa11", &mut |c| {
                        c.usage_count += 1;
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get_by_id("aa11").unwrap().usage_count, 51);
    }
}
