//! Read-only view of an agent's conversation graph.
//!
//! The graph is loaded once from the agent export and shared as
//! `Arc<NodeGraph>`; nothing in the crate mutates it afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};

/// A unit of the conversation flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    /// Top-level display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Top-level display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node kind as exported by the agent builder (e.g. "conversation").
    #[serde(rename = "type", default)]
    pub node_type: String,
    /// Prompt, transitions and display metadata.
    #[serde(default)]
    pub data: NodeData,
}

/// Node payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Stored prompt text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Preferred display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Conditional outgoing transitions.
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
    /// Unconditional transition taken after the node completes.
    #[serde(
        default,
        alias = "autoTransitionTo",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_transition_to: Option<String>,
}

/// A transition entry as stored on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(
        default,
        rename = "nextNode",
        alias = "next_node",
        alias = "target",
        alias = "to"
    )]
    pub next_node: Option<String>,
}

/// A directed edge derived from a node's transition list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// True for the unconditional `auto_transition_to` edge.
    pub automatic: bool,
}

/// Result of resolving a node by id or human label.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeLookup<'a> {
    /// Exact id match.
    ById(&'a Node),
    /// No id matched; exactly one node carries the label.
    ByLabel(&'a Node),
    /// No id matched; several nodes carry the label.
    Ambiguous(Vec<&'a Node>),
    NotFound,
}

impl<'a> NodeLookup<'a> {
    /// The resolved node, if the lookup was unambiguous.
    pub fn node(&self) -> Option<&'a Node> {
        match self {
            NodeLookup::ById(node) | NodeLookup::ByLabel(node) => Some(*node),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GraphDocument {
    Nodes(Vec<Node>),
    Wrapped { nodes: Vec<Node> },
}

/// Immutable conversation graph.
#[derive(Debug, Clone, Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Node {
    /// Create a bare node with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            name: None,
            node_type: "conversation".to_string(),
            data: NodeData::default(),
        }
    }

    /// Set the data label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.data.label = Some(label.into());
        self
    }

    /// Set the stored prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.data.prompt = Some(prompt.into());
        self
    }

    /// Add a conditional transition.
    pub fn with_transition(mut self, condition: impl Into<String>, to: impl Into<String>) -> Self {
        self.data.transitions.push(TransitionSpec {
            id: None,
            condition: Some(condition.into()),
            next_node: Some(to.into()),
        });
        self
    }

    /// Set the unconditional auto-transition.
    pub fn with_auto_transition(mut self, to: impl Into<String>) -> Self {
        self.data.auto_transition_to = Some(to.into());
        self
    }

    /// Human label in priority order: `data.label`, `data.name`, `name`,
    /// `label`, then the id.
    pub fn display_label(&self) -> &str {
        self.label_candidates().next().unwrap_or(&self.id)
    }

    fn label_candidates(&self) -> impl Iterator<Item = &str> {
        [
            self.data.label.as_deref(),
            self.data.name.as_deref(),
            self.name.as_deref(),
            self.label.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
    }

    fn has_label(&self, key: &str) -> bool {
        self.label_candidates().any(|l| l == key)
    }
}

impl NodeGraph {
    /// Build a graph from nodes, rejecting empty or duplicate ids.
    pub fn from_nodes(nodes: Vec<Node>) -> GraphResult<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(GraphError::EmptyNodeId);
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        let graph = Self { nodes, index };
        for edge in graph.nodes.iter().flat_map(|n| graph.edges_from(&n.id)) {
            if !graph.contains(&edge.to) {
                warn!(from = %edge.from, to = %edge.to, "Transition targets unknown node");
            }
        }
        debug!(nodes = graph.nodes.len(), "Node graph built");
        Ok(graph)
    }

    /// Parse a graph from JSON: either a bare node array or `{ "nodes": [...] }`.
    pub fn from_json_str(json: &str) -> GraphResult<Self> {
        let nodes = match serde_json::from_str::<GraphDocument>(json)? {
            GraphDocument::Nodes(nodes) | GraphDocument::Wrapped { nodes } => nodes,
        };
        Self::from_nodes(nodes)
    }

    /// Load a graph export from disk.
    pub fn load(path: &Path) -> GraphResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| GraphError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    /// Raw outgoing edges of a node, explicit transitions first.
    pub fn edges_from(&self, node_id: &str) -> Vec<Transition> {
        let Some(node) = self.get(node_id) else {
            return Vec::new();
        };

        let mut edges: Vec<Transition> = node
            .data
            .transitions
            .iter()
            .filter_map(|t| {
                let to = t.next_node.as_deref().filter(|s| !s.trim().is_empty())?;
                Some(Transition {
                    from: node.id.clone(),
                    to: to.to_string(),
                    condition: t.condition.clone(),
                    automatic: false,
                })
            })
            .collect();

        if let Some(to) = node
            .data
            .auto_transition_to
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            edges.push(Transition {
                from: node.id.clone(),
                to: to.to_string(),
                condition: None,
                automatic: true,
            });
        }

        edges
    }

    /// Target nodes reachable in one step, de-duplicated by id.
    pub fn transitions_from(&self, node_id: Option<&str>) -> Vec<&Node> {
        let Some(node_id) = node_id else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self.edges_from(node_id)
            .into_iter()
            .filter_map(|edge| self.get(&edge.to))
            .filter(|target| seen.insert(target.id.clone()))
            .collect()
    }

    /// Best-effort display label; unknown ids come back unchanged.
    pub fn resolve_label(&self, node_id: &str) -> String {
        self.get(node_id)
            .map(|n| n.display_label().to_string())
            .unwrap_or_else(|| node_id.to_string())
    }

    /// Resolve a deep-link key that may be an id or a human label.
    pub fn find_by_id_or_label(&self, key: &str) -> NodeLookup<'_> {
        if let Some(node) = self.get(key) {
            return NodeLookup::ById(node);
        }

        let mut matches: Vec<&Node> = self.nodes.iter().filter(|n| n.has_label(key)).collect();
        match matches.len() {
            0 => NodeLookup::NotFound,
            1 => NodeLookup::ByLabel(matches.remove(0)),
            _ => {
                warn!(key = %key, matches = matches.len(), "Ambiguous node label");
                NodeLookup::Ambiguous(matches)
            }
        }
    }
}
