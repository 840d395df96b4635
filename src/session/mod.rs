//! Manual, turn-by-turn test sessions against the agent graph.
//!
//! A [`TestSession`] is a plain value owned by the caller. Every operation
//! takes it explicitly, and `send_turn` borrows it mutably, so only one turn
//! can be in flight per session.

mod assertion;

pub use assertion::{AssertedNode, TransitionAssertion};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, RuntimeError, SessionError, ValidationError};
use crate::graph::NodeGraph;
use crate::overrides::OverrideStore;
use crate::runtime::{AgentRuntime, NodeTransition, StartTestRequest, TestMessageRequest};

/// A node the session visited, and the turn it was reached on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeVisit {
    pub node_id: String,
    pub turn: u32,
}

/// Who said a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Agent,
}

/// One line of the manual test transcript.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// State of one manual test session.
#[derive(Debug, Clone, Serialize)]
pub struct TestSession {
    key: String,
    session_id: Option<String>,
    agent_name: Option<String>,
    start_node_id: Option<String>,
    current_node_id: Option<String>,
    node_history: Vec<NodeVisit>,
    variables: Map<String, Value>,
    should_end_call: bool,
    turn: u32,
    transcript: Vec<TranscriptEntry>,
    created_at: DateTime<Utc>,
}

impl TestSession {
    fn new(start_node_id: Option<String>) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            session_id: None,
            agent_name: None,
            start_node_id,
            current_node_id: None,
            node_history: Vec::new(),
            variables: Map::new(),
            should_end_call: false,
            turn: 0,
            transcript: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Stable local handle; survives remote restarts and resets.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remote session id, absent until the first start or after a reset.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    pub fn start_node_id(&self) -> Option<&str> {
        self.start_node_id.as_deref()
    }

    pub fn current_node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    pub fn node_history(&self) -> &[NodeVisit] {
        &self.node_history
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn should_end_call(&self) -> bool {
        self.should_end_call
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Drop everything the remote session produced; keep the key and the
    /// configured start node.
    fn clear_remote_state(&mut self) {
        self.session_id = None;
        self.agent_name = None;
        self.current_node_id = None;
        self.node_history.clear();
        self.variables.clear();
        self.should_end_call = false;
        self.turn = 0;
        self.transcript.clear();
    }

    fn push_transcript(&mut self, speaker: Speaker, text: &str, node_id: Option<String>) {
        if text.trim().is_empty() {
            return;
        }
        self.transcript.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
            node_id,
            at: Utc::now(),
        });
    }
}

/// One caller utterance plus an optional expected destination.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    pub expected_next_node_id: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            expected_next_node_id: None,
        }
    }

    pub fn expecting(mut self, node_id: impl Into<String>) -> Self {
        self.expected_next_node_id = Some(node_id.into());
        self
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub agent_text: String,
    pub current_node_id: Option<String>,
    pub current_node_label: Option<String>,
    pub transitions: Vec<NodeTransition>,
    pub variables: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub should_end_call: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion: Option<TransitionAssertion>,
}

/// What happened to a turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed(TurnResult),
    /// The remote session had expired and a fresh one was started; the
    /// caller should resend the turn.
    Restarted { session_id: String, notice: String },
}

/// Drives manual test sessions against the agent runtime.
#[derive(Clone)]
pub struct TestSessionManager {
    runtime: Arc<dyn AgentRuntime>,
    graph: Arc<NodeGraph>,
}

impl TestSessionManager {
    pub fn new(runtime: Arc<dyn AgentRuntime>, graph: Arc<NodeGraph>) -> Self {
        Self { runtime, graph }
    }

    /// Create a session that is opened remotely on its first message.
    pub fn new_session(&self, start_node_id: Option<&str>) -> Result<TestSession, ValidationError> {
        let start_node_id = self.validate_node(start_node_id)?;
        Ok(TestSession::new(start_node_id))
    }

    /// Create and open a session, seeding the start node when given.
    pub async fn start(&self, start_node_id: Option<&str>) -> AppResult<TestSession> {
        let mut session = self.new_session(start_node_id)?;
        self.open(&mut session).await?;
        Ok(session)
    }

    async fn open(&self, session: &mut TestSession) -> AppResult<()> {
        let response = self
            .runtime
            .start_test(StartTestRequest {
                start_node_id: session.start_node_id.clone(),
            })
            .await?;

        session.clear_remote_state();
        session.session_id = Some(response.session_id);
        session.agent_name = response.agent_name;

        if let Some(start) = session.start_node_id.clone() {
            session.current_node_id = Some(start.clone());
            session.node_history.push(NodeVisit {
                node_id: start,
                turn: 0,
            });
        }

        if let Some(greeting) = response.greeting_text {
            let node = session.current_node_id.clone();
            session.push_transcript(Speaker::Agent, &greeting, node);
        }

        info!(
            key = %session.key,
            session_id = ?session.session_id,
            start_node = ?session.start_node_id,
            "Test session opened"
        );
        Ok(())
    }

    /// Send one caller message and fold the runtime's answer into the session.
    pub async fn send_turn(
        &self,
        session: &mut TestSession,
        turn: TurnRequest,
        overrides: &OverrideStore,
    ) -> AppResult<TurnOutcome> {
        if turn.message.trim().is_empty() {
            return Err(ValidationError::Field {
                field: "message".to_string(),
                reason: "Message cannot be empty".to_string(),
            }
            .into());
        }
        let expected = self.validate_node(turn.expected_next_node_id.as_deref())?;

        if session.session_id.is_none() {
            self.open(session).await?;
        }
        let session_id = session.session_id.clone().unwrap_or_default();

        let request = TestMessageRequest {
            session_id: session_id.clone(),
            message: turn.message.clone(),
            expected_next_node_id: expected.clone(),
            overrides: overrides.as_map().clone(),
        };

        let response = match self.runtime.send_test_message(request).await {
            Ok(response) => response,
            Err(e) if e.is_session_not_found() => {
                warn!(
                    key = %session.key,
                    stale_session = %session_id,
                    "Test session expired, starting a new one"
                );
                return self.restart(session).await;
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(node_id) = response.current_node_id.as_deref() {
            if !self.graph.contains(node_id) {
                return Err(RuntimeError::InvalidResponse {
                    message: format!("Runtime reported unknown node: {}", node_id),
                }
                .into());
            }
        }

        let previous_node = session
            .current_node_id
            .clone()
            .or_else(|| session.start_node_id.clone());

        session.turn += 1;
        let caller_node = session.current_node_id.clone();
        session.push_transcript(Speaker::Caller, &turn.message, caller_node);

        if let Some(node_id) = response.current_node_id.clone() {
            session.current_node_id = Some(node_id.clone());
            session.node_history.push(NodeVisit {
                node_id,
                turn: session.turn,
            });
        }
        session
            .variables
            .extend(response.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        session.should_end_call = response.should_end_call;

        let agent_node = session.current_node_id.clone();
        session.push_transcript(Speaker::Agent, &response.agent_response, agent_node);

        let assertion = expected.as_deref().map(|expected| {
            let matched_condition = response
                .transition_test
                .as_ref()
                .and_then(|t| t.matched_condition.clone());
            TransitionAssertion::evaluate(
                &self.graph,
                previous_node.as_deref(),
                expected,
                session.current_node_id.as_deref(),
                matched_condition,
            )
        });

        if let Some(assertion) = &assertion {
            info!(
                key = %session.key,
                expected = %assertion.expected_node.id,
                actual = ?assertion.actual_node.as_ref().map(|n| n.id.as_str()),
                passed = assertion.passed,
                "Transition assertion evaluated"
            );
        }

        let transitions = response
            .node_transitions
            .iter()
            .cloned()
            .map(|t| self.label_transition(t))
            .collect();

        debug!(
            key = %session.key,
            turn = session.turn,
            current_node = ?session.current_node_id,
            "Turn completed"
        );

        Ok(TurnOutcome::Completed(TurnResult {
            agent_text: response.agent_response,
            current_node_label: session
                .current_node_id
                .as_deref()
                .map(|id| self.graph.resolve_label(id)),
            current_node_id: session.current_node_id.clone(),
            transitions,
            variables: session.variables.clone(),
            metrics: response.metrics,
            should_end_call: session.should_end_call,
            assertion,
        }))
    }

    /// Single automatic restart after the remote session expired.
    async fn restart(&self, session: &mut TestSession) -> AppResult<TurnOutcome> {
        session.clear_remote_state();
        if let Err(e) = self.open(session).await {
            return Err(SessionError::RestartFailed {
                message: e.to_string(),
            }
            .into());
        }

        let session_id = session.session_id.clone().unwrap_or_default();
        Ok(TurnOutcome::Restarted {
            session_id,
            notice: "Test session expired and was restarted; please resend your message."
                .to_string(),
        })
    }

    /// Discard all session state but keep the configured start node.
    ///
    /// Local state is cleared before the remote reset is sent, so a failed
    /// reset still leaves the session ready to open fresh on the next message.
    pub async fn reset(&self, session: &mut TestSession) -> AppResult<()> {
        let remote = session.session_id.clone();
        session.clear_remote_state();
        info!(key = %session.key, "Test session reset");

        if let Some(session_id) = remote {
            self.runtime.reset_test(session_id).await?;
        }
        Ok(())
    }

    fn validate_node(&self, node_id: Option<&str>) -> Result<Option<String>, ValidationError> {
        match node_id.map(str::trim).filter(|id| !id.is_empty()) {
            None => Ok(None),
            Some(id) if self.graph.contains(id) => Ok(Some(id.to_string())),
            Some(id) => Err(ValidationError::UnknownNode {
                node_id: id.to_string(),
            }),
        }
    }

    fn label_transition(&self, mut transition: NodeTransition) -> NodeTransition {
        if transition.to_label.is_none() {
            transition.to_label = Some(self.graph.resolve_label(&transition.to_node_id));
        }
        if transition.from_label.is_none() {
            transition.from_label = transition
                .from_node_id
                .as_deref()
                .map(|id| self.graph.resolve_label(id));
        }
        transition
    }
}
