//! Capability Registry
//!
//! Persists executed workflows as reusable capabilities: content-addressed
//! templates with intent embeddings and usage statistics. Lookup by id, by
//! fully-qualified name, and by intent similarity; dependency edges record
//! how capabilities compose across workflows.

mod capability;
mod search;
mod store;

pub use capability::{
    capability_id, default_action, Capability, CapabilityDependency, EdgeType, DEFAULT_NAMESPACE,
};
pub use search::{cosine, CosineScorer, Embedder, HashEmbedder, Ranked, Scorer};
pub use store::{CapabilityStore, MemoryStore};

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::{PmlError, Result};
use crate::event::{EventBus, EventKind};
use crate::runtime::{CapabilityResolver, ExecutionTrace};

/// The registry facade: storage + embedding + scoring + event emission.
pub struct CapabilityRegistry {
    store: Arc<dyn CapabilityStore>,
    embedder: Arc<dyn Embedder>,
    scorer: Arc<dyn Scorer>,
    bus: Arc<EventBus>,
}

impl CapabilityRegistry {
    pub fn new(
        store: Arc<dyn CapabilityStore>,
        embedder: Arc<dyn Embedder>,
        scorer: Arc<dyn Scorer>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            embedder,
            scorer,
            bus,
        }
    }

    /// In-memory registry with the reference embedder and scorer.
    pub fn in_memory(bus: Arc<EventBus>) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(HashEmbedder::default()),
            Arc::new(CosineScorer),
            bus,
        )
    }

    pub fn get_by_id(&self, id: &str) -> Option<Capability> {
        self.store.get_by_id(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Capability> {
        self.store.get_by_name(name)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Save a completed execution as a capability.
    ///
    /// Deduplicates on `hash(code_template)`: a hit bumps the usage counters
    /// and merges `tools_used` without touching the stored template, and
    /// emits `capability.matched`; a miss inserts and emits
    /// `capability.learned`.
    pub fn save_execution(&self, trace: &ExecutionTrace, code_template: &str) -> Capability {
        let id = capability_id(code_template);

        if let Some(existing) = self.store.get_by_id(&id) {
            self.store.update(&id, &mut |cap| {
                cap.record_execution(trace.success);
                cap.merge_tools(&trace.executed_path);
            });
            let updated = self.store.get_by_id(&id).unwrap_or(existing);
            self.bus.publish(
                "registry",
                EventKind::CapabilityMatched {
                    capability_id: Arc::from(id.as_str()),
                    name: Arc::from(updated.name.as_str()),
                    usage_count: updated.usage_count,
                },
            );
            return updated;
        }

        let name = format!("{}:{}", DEFAULT_NAMESPACE, default_action(&id));
        let capability = Capability {
            id: id.clone(),
            name: name.clone(),
            code_template: code_template.to_string(),
            intent: trace.intent.clone(),
            intent_embedding: self.embedder.encode(&trace.intent),
            tools_used: trace.executed_path.clone(),
            success_rate: if trace.success { 1.0 } else { 0.0 },
            usage_count: 1,
            created_at: Utc::now(),
            last_used: Utc::now(),
        };
        self.store.insert(capability.clone());
        info!(capability = %name, "learned capability");

        self.bus.publish(
            "registry",
            EventKind::CapabilityLearned {
                capability_id: Arc::from(id.as_str()),
                name: Arc::from(name.as_str()),
                tools_used: trace.executed_path.clone(),
            },
        );

        capability
    }

    /// Rename a capability. The similarity embedding follows the new name
    /// so renames improve discovery.
    pub fn rename(&self, id: &str, namespace: &str, action: &str) -> Result<Capability> {
        let new_name = format!("{}:{}", namespace, action);
        let embedding = self.embedder.encode(&format!("{} {}", new_name, action));
        let found = self.store.update(id, &mut |cap| {
            cap.name = new_name.clone();
            cap.intent_embedding = embedding.clone();
        });
        if !found {
            return Err(PmlError::CapabilityNotFound { id: id.to_string() });
        }
        self.store
            .get_by_id(id)
            .ok_or_else(|| PmlError::CapabilityNotFound { id: id.to_string() })
    }

    /// Record dependency edges observed during one workflow and emit
    /// `graph.synced`.
    pub fn record_edges(&self, edges: &[(String, String, EdgeType)]) {
        for (from, to, edge_type) in edges {
            self.store.record_edge(from, to, *edge_type);
        }
        if !edges.is_empty() {
            self.bus
                .publish("registry", EventKind::GraphSynced { edges: edges.len() });
        }
    }

    pub fn edges(&self) -> Vec<CapabilityDependency> {
        self.store.edges()
    }

    /// Similarity search over stored capabilities.
    pub fn search(
        &self,
        intent: &str,
        min_score: f32,
        limit: usize,
        context_tools: &[Arc<str>],
    ) -> Vec<(Capability, f32)> {
        let intent_embedding = self.embedder.encode(intent);
        let candidates = self.store.all();
        let ranked = self
            .scorer
            .score(&intent_embedding, &candidates, context_tools);

        ranked
            .into_iter()
            .filter(|r| r.score >= min_score)
            .take(limit)
            .filter_map(|r| self.store.get_by_id(&r.id).map(|c| (c, r.score)))
            .collect()
    }

    /// Embed arbitrary text with the registry's embedder (used to rank tool
    /// descriptors alongside capabilities).
    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.encode(text)
    }
}

impl CapabilityResolver for CapabilityRegistry {
    /// `capabilities.<name>(...)` resolves by action, by full name, or by id.
    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(cap) = self.store.get_by_name(name) {
            return Some(cap.code_template);
        }
        if let Some(cap) = self
            .store
            .all()
            .into_iter()
            .find(|c| c.action() == name || c.id == name)
        {
            return Some(cap.code_template);
        }
        None
    }
}
