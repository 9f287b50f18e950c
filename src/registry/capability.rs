//! Capability Records - content-addressed code templates
//!
//! `Capability.id = hash(codeTemplate)`: same code, same id. The display
//! name is `namespace:action`; the default action is `exec_` plus the first
//! eight hex chars of the id. Dependency edges form a multigraph keyed by
//! edge type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Content hash of a code template (16 hex chars).
pub fn capability_id(code_template: &str) -> String {
    format!("{:016x}", xxh3_64(code_template.as_bytes()))
}

/// Default action name for a capability id.
pub fn default_action(id: &str) -> String {
    format!("exec_{}", &id[..8.min(id.len())])
}

/// Default namespace for learned capabilities.
pub const DEFAULT_NAMESPACE: &str = "learned";

/// A stored, reusable code template with usage statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// `hash(code_template)`
    pub id: String,
    /// `namespace:action`
    pub name: String,
    pub code_template: String,
    pub intent: String,
    pub intent_embedding: Vec<f32>,
    pub tools_used: Vec<Arc<str>>,
    /// Rolling success rate over recorded executions
    pub success_rate: f64,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl Capability {
    pub fn namespace(&self) -> &str {
        self.name.split_once(':').map(|(ns, _)| ns).unwrap_or("")
    }

    pub fn action(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, action)| action)
            .unwrap_or(&self.name)
    }

    /// Fold one more observed execution into the rolling success rate.
    pub fn record_execution(&mut self, success: bool) {
        let n = self.usage_count as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * n + outcome) / (n + 1.0);
        self.usage_count += 1;
        self.last_used = Utc::now();
    }

    /// Merge newly-observed tools (set union, first-seen order kept).
    pub fn merge_tools(&mut self, tools: &[Arc<str>]) {
        for tool in tools {
            if !self.tools_used.iter().any(|t| t == tool) {
                self.tools_used.push(Arc::clone(tool));
            }
        }
    }
}

/// Directed dependency edge kinds between capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Contains,
    Sequence,
    Dependency,
    Alternative,
    Provides,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "contains",
            EdgeType::Sequence => "sequence",
            EdgeType::Dependency => "dependency",
            EdgeType::Alternative => "alternative",
            EdgeType::Provides => "provides",
        }
    }
}

/// Weighted edge in the capability multigraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDependency {
    pub from_capability_id: String,
    pub to_capability_id: String,
    pub edge_type: EdgeType,
    pub observed_count: u64,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

impl CapabilityDependency {
    pub fn new(from: &str, to: &str, edge_type: EdgeType) -> Self {
        let now = Utc::now();
        Self {
            from_capability_id: from.to_string(),
            to_capability_id: to.to_string(),
            edge_type,
            observed_count: 1,
            confidence_score: 0.5,
            created_at: now,
            last_observed: now,
        }
    }

    /// One more observation; confidence approaches 1 asymptotically.
    pub fn observe(&mut self) {
        self.observed_count += 1;
        self.confidence_score = 1.0 - 1.0 / (1.0 + self.observed_count as f64 * 0.25);
        self.last_observed = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_for_same_code() {
        let a = capability_id("const d = n.map(x => x * 2); return d;");
        let b = capability_id("const d = n.map(x => x * 2); return d;");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn different_code_different_id() {
        let a = capability_id("return 1;");
        let b = capability_id("return 2;");
        assert_ne!(a, b);
    }

    #[test]
    fn default_action_uses_first_eight_hex() {
        let id = capability_id("return 1;");
        let action = default_action(&id);
        assert!(action.starts_with("exec_"));
        assert_eq!(action.len(), 5 + 8);
        assert!(id.starts_with(&action[5..]));
    }

    #[test]
    fn name_parts() {
        let cap = Capability {
            id: "abcd".to_string(),
            name: "learned:exec_abcd1234".to_string(),
            code_template: String::new(),
            intent: String::new(),
            intent_embedding: vec![],
            tools_used: vec![],
            success_rate: 1.0,
            usage_count: 1,
            created_at: Utc::now(),
            last_used: Utc::now(),
        };
        assert_eq!(cap.namespace(), "learned");
        assert_eq!(cap.action(), "exec_abcd1234");
    }

    #[test]
    fn rolling_success_rate() {
        let mut cap = Capability {
            id: "x".to_string(),
            name: "learned:x".to_string(),
            code_template: String::new(),
            intent: String::new(),
            intent_embedding: vec![],
            tools_used: vec![],
            success_rate: 1.0,
            usage_count: 1,
            created_at: Utc::now(),
            last_used: Utc::now(),
        };
        cap.record_execution(false);
        assert_eq!(cap.usage_count, 2);
        assert!((cap.success_rate - 0.5).abs() < f64::EPSILON);
        cap.record_execution(true);
        assert!((cap.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn merge_tools_is_set_union() {
        let mut cap = Capability {
            id: "x".to_string(),
            name: "learned:x".to_string(),
            code_template: String::new(),
            intent: String::new(),
            intent_embedding: vec![],
            tools_used: vec![Arc::from("db:query")],
            success_rate: 1.0,
            usage_count: 1,
            created_at: Utc::now(),
            last_used: Utc::now(),
        };
        cap.merge_tools(&[Arc::from("db:query"), Arc::from("code:map")]);
        assert_eq!(cap.tools_used.len(), 2);
    }

    #[test]
    fn edge_confidence_grows_with_observations() {
        let mut edge = CapabilityDependency::new("a", "b", EdgeType::Sequence);
        let initial = edge.confidence_score;
        edge.observe();
        edge.observe();
        assert!(edge.confidence_score > initial);
        assert!(edge.confidence_score < 1.0);
        assert_eq!(edge.observed_count, 3);
    }
}
