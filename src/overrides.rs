//! Transient per-node prompt overrides for test runs.
//!
//! Overrides are sent with every test turn so the runtime evaluates the
//! overridden text instead of the stored prompt. They are never persisted by
//! this crate.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ValidationError;
use crate::graph::NodeGraph;

/// Node id → prompt text substituted for the duration of a test turn.
#[derive(Debug, Clone)]
pub struct OverrideStore {
    graph: Arc<NodeGraph>,
    overrides: BTreeMap<String, String>,
}

impl OverrideStore {
    pub fn new(graph: Arc<NodeGraph>) -> Self {
        Self {
            graph,
            overrides: BTreeMap::new(),
        }
    }

    /// Set an override. Blank text clears the node's override.
    pub fn set(&mut self, node_id: &str, text: impl Into<String>) -> Result<(), ValidationError> {
        if !self.graph.contains(node_id) {
            return Err(ValidationError::UnknownNode {
                node_id: node_id.to_string(),
            });
        }

        let text = text.into();
        if text.trim().is_empty() {
            self.clear(node_id);
            return Ok(());
        }

        debug!(node_id = %node_id, chars = text.len(), "Prompt override set");
        self.overrides.insert(node_id.to_string(), text);
        Ok(())
    }

    /// Remove a node's override; returns whether one was present.
    pub fn clear(&mut self, node_id: &str) -> bool {
        self.overrides.remove(node_id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.overrides.clear();
    }

    pub fn get(&self, node_id: &str) -> Option<&str> {
        self.overrides.get(node_id).map(String::as_str)
    }

    /// Prompt in effect for a node: the override if set, else the stored prompt.
    pub fn effective_prompt(&self, node_id: &str) -> Option<&str> {
        self.get(node_id).or_else(|| {
            self.graph
                .get(node_id)
                .and_then(|n| n.data.prompt.as_deref())
        })
    }

    /// The map sent alongside each test message.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.overrides
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}
