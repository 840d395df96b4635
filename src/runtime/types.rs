use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Request to open a manual test session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<String>,
}

/// Response to `test/start`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestResponse {
    pub session_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub greeting_text: Option<String>,
}

/// A single test message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessageRequest {
    pub session_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_next_node_id: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

/// Response to `test/message`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestMessageResponse {
    pub agent_response: String,
    pub current_node_id: Option<String>,
    pub current_node_label: Option<String>,
    pub node_transitions: Vec<NodeTransition>,
    pub variables: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub should_end_call: bool,
    pub transition_test: Option<RemoteTransitionTest>,
    pub error: Option<String>,
}

/// A node change reported by the runtime during a turn or simulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeTransition {
    #[serde(alias = "from", skip_serializing_if = "Option::is_none")]
    pub from_node_id: Option<String>,
    #[serde(alias = "to")]
    pub to_node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
}

/// Transition check as evaluated by the runtime
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTransitionTest {
    pub expected_node_id: Option<String>,
    pub actual_node_id: Option<String>,
    pub passed: Option<bool>,
    pub matched_condition: Option<String>,
}

/// Simulated caller persona
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Compliant,
    Skeptical,
    Hostile,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Compliant => "compliant",
            Difficulty::Skeptical => "skeptical",
            Difficulty::Hostile => "hostile",
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compliant" => Ok(Difficulty::Compliant),
            "skeptical" => Ok(Difficulty::Skeptical),
            "hostile" => Ok(Difficulty::Hostile),
            _ => Err(format!("Unknown difficulty: {}", s)),
        }
    }
}

/// Request to launch a simulated caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTestStartRequest {
    pub difficulty: Difficulty,
    pub max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<String>,
}

/// Response to `auto-test/start`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTestStartResponse {
    pub session_id: String,
}

/// Lifecycle of a simulated conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTestStatus {
    Starting,
    #[serde(alias = "in_progress")]
    Running,
    Completed,
    Stopped,
    #[serde(alias = "failed")]
    Error,
}

impl AutoTestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoTestStatus::Starting => "starting",
            AutoTestStatus::Running => "running",
            AutoTestStatus::Completed => "completed",
            AutoTestStatus::Stopped => "stopped",
            AutoTestStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutoTestStatus::Completed | AutoTestStatus::Stopped | AutoTestStatus::Error
        )
    }
}

impl std::fmt::Display for AutoTestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One utterance of a simulated conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationTurn {
    #[serde(alias = "speaker")]
    pub role: String,
    #[serde(alias = "message", alias = "text")]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u32>,
}

/// Response to `auto-test/status/{id}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTestStatusResponse {
    pub status: AutoTestStatus,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    #[serde(default)]
    pub node_transitions: Vec<NodeTransition>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Request to start a repair run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixNodesRequest {
    pub node_ids: Vec<String>,
    pub test_responses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_behavior: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub initial_variables: Map<String, Value>,
    pub max_iterations: u32,
}

/// Status carried by a repair progress frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    /// Stream framing marker, not a domain state
    Started,
    /// Stream framing marker, not a domain state
    Complete,
    Initializing,
    Analyzing,
    Testing,
    IdentifyingIssues,
    ProposingFix,
    ApplyingFix,
    Retesting,
    Success,
    Failed,
    Cancelled,
    Error,
    #[serde(other)]
    Unknown,
}

impl FrameStatus {
    pub fn is_marker(&self) -> bool {
        matches!(self, FrameStatus::Started | FrameStatus::Complete)
    }
}

/// A proposed prompt change for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeChange {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,
    #[serde(alias = "proposed_prompt")]
    pub new_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One parsed `data:` frame of the repair stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFrame {
    pub status: FrameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_changes: Option<Vec<NodeChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_graph: Option<Value>,
}

impl ProgressFrame {
    /// A bare frame with only a status
    pub fn new(status: FrameStatus) -> Self {
        Self {
            status,
            session_id: None,
            iteration: None,
            max_iterations: None,
            message: None,
            details: None,
            node_changes: None,
            test_results: None,
            fixed_graph: None,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_node_changes(mut self, changes: Vec<NodeChange>) -> Self {
        self.node_changes = Some(changes);
        self
    }

    pub fn with_fixed_graph(mut self, graph: Value) -> Self {
        self.fixed_graph = Some(graph);
        self
    }

    /// The fixed graph, whether sent top-level or inside `details`
    pub fn fixed_graph(&self) -> Option<&Value> {
        self.fixed_graph.as_ref().or_else(|| {
            self.details
                .as_ref()
                .and_then(|d| d.get("fixed_graph").or_else(|| d.get("fixedGraph")))
                .filter(|v| !v.is_null())
        })
    }
}

/// Commit request for an accepted repair
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFixedNodesRequest {
    pub fixed_graph: Value,
}

/// Response to `apply-fixed-nodes`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFixedNodesResponse {
    pub success: bool,
    #[serde(default)]
    pub applied_graph: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}
