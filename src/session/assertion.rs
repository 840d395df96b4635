use serde::Serialize;

use crate::graph::NodeGraph;

/// A node as shown in an assertion: id plus resolved label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssertedNode {
    pub id: String,
    pub label: String,
}

impl AssertedNode {
    fn resolve(graph: &NodeGraph, id: &str) -> Self {
        Self {
            id: id.to_string(),
            label: graph.resolve_label(id),
        }
    }
}

/// Outcome of checking where a turn actually went against where it was
/// expected to go. Lives only as long as the turn's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionAssertion {
    pub start_node: Option<AssertedNode>,
    pub expected_node: AssertedNode,
    pub actual_node: Option<AssertedNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_condition: Option<String>,
    pub passed: bool,
}

impl TransitionAssertion {
    pub fn evaluate(
        graph: &NodeGraph,
        start_node: Option<&str>,
        expected_node: &str,
        actual_node: Option<&str>,
        matched_condition: Option<String>,
    ) -> Self {
        Self {
            start_node: start_node.map(|id| AssertedNode::resolve(graph, id)),
            expected_node: AssertedNode::resolve(graph, expected_node),
            actual_node: actual_node.map(|id| AssertedNode::resolve(graph, id)),
            matched_condition,
            passed: actual_node == Some(expected_node),
        }
    }

    /// Headline shown to the operator.
    pub fn summary(&self) -> &'static str {
        if self.passed {
            "Transition Test Passed"
        } else {
            "Transition Test Failed"
        }
    }
}
