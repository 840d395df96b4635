//! Simulated-caller runs.
//!
//! The runtime plays a caller persona against the agent; this side only
//! launches the run, polls its status until it leaves `running`, and keeps a
//! local snapshot. A stop is authoritative locally: the snapshot flips to
//! `stopped` before the remote side is asked to stop.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::error::{AppResult, RuntimeError, ValidationError};
use crate::graph::NodeGraph;
use crate::polling::{poll_until_terminal, PollStatus};
use crate::runtime::{
    AgentRuntime, AutoTestStartRequest, AutoTestStatus, AutoTestStatusResponse, ConversationTurn,
    Difficulty, NodeTransition,
};

impl PollStatus for AutoTestStatusResponse {
    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Parameters of a simulated run.
#[derive(Debug, Clone)]
pub struct AutoTestConfig {
    pub difficulty: Difficulty,
    pub max_turns: u32,
    pub custom_instructions: Option<String>,
    pub start_node_id: Option<String>,
}

impl AutoTestConfig {
    pub fn new(difficulty: Difficulty, max_turns: u32) -> Self {
        Self {
            difficulty,
            max_turns,
            custom_instructions: None,
            start_node_id: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.custom_instructions = Some(instructions.into());
        self
    }

    pub fn with_start_node(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }
}

/// Local view of one simulated run.
#[derive(Debug, Clone, Serialize)]
pub struct AutoTestSession {
    pub session_id: String,
    pub difficulty: Difficulty,
    pub max_turns: u32,
    pub status: AutoTestStatus,
    pub conversation_log: Vec<ConversationTurn>,
    pub node_transitions: Vec<NodeTransition>,
    pub polls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    consecutive_failures: u32,
}

impl AutoTestSession {
    fn new(session_id: String, difficulty: Difficulty, max_turns: u32) -> Self {
        Self {
            session_id,
            difficulty,
            max_turns,
            status: AutoTestStatus::Starting,
            conversation_log: Vec::new(),
            node_transitions: Vec::new(),
            polls: 0,
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn finish(&mut self, status: AutoTestStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Fold a status snapshot in. Returns false once the session is
    /// terminal and the snapshot was ignored.
    fn apply_status(&mut self, snapshot: AutoTestStatusResponse) -> bool {
        if self.is_terminal() {
            return false;
        }

        self.polls += 1;
        self.consecutive_failures = 0;
        self.conversation_log = snapshot.conversation;
        self.node_transitions = snapshot.node_transitions;

        match snapshot.status {
            AutoTestStatus::Starting | AutoTestStatus::Running => {
                self.status = AutoTestStatus::Running;
            }
            terminal => {
                if let Some(message) = snapshot.error {
                    self.last_error = Some(message);
                }
                self.finish(terminal);
            }
        }
        true
    }

    /// Record a failed poll. Returns true when the run has been moved to
    /// `error` and polling should stop.
    fn record_failure(&mut self, err: &RuntimeError, max_failures: u32) -> bool {
        if self.is_terminal() {
            return true;
        }

        self.consecutive_failures += 1;
        self.last_error = Some(err.to_string());

        if err.is_session_not_found() || self.consecutive_failures >= max_failures {
            self.finish(AutoTestStatus::Error);
            return true;
        }
        false
    }

    fn mark_stopped(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.finish(AutoTestStatus::Stopped);
        true
    }
}

/// Launches simulated-caller runs.
#[derive(Clone)]
pub struct AutoTestSimulator {
    runtime: Arc<dyn AgentRuntime>,
    graph: Arc<NodeGraph>,
    polling: PollingConfig,
}

impl AutoTestSimulator {
    pub fn new(runtime: Arc<dyn AgentRuntime>, graph: Arc<NodeGraph>, polling: PollingConfig) -> Self {
        Self {
            runtime,
            graph,
            polling,
        }
    }

    fn validate(&self, config: &AutoTestConfig) -> Result<(), ValidationError> {
        if config.max_turns == 0 || config.max_turns > self.polling.max_auto_test_turns {
            return Err(ValidationError::Field {
                field: "max_turns".to_string(),
                reason: format!(
                    "must be between 1 and {}",
                    self.polling.max_auto_test_turns
                ),
            });
        }
        if let Some(node_id) = &config.start_node_id {
            if !self.graph.contains(node_id) {
                return Err(ValidationError::UnknownNode {
                    node_id: node_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Start a run and spawn its status poll.
    pub async fn start(&self, config: AutoTestConfig) -> AppResult<AutoTestRun> {
        self.validate(&config)?;

        let response = self
            .runtime
            .start_auto_test(AutoTestStartRequest {
                difficulty: config.difficulty,
                max_turns: config.max_turns,
                custom_instructions: config.custom_instructions.clone(),
                start_node_id: config.start_node_id.clone(),
            })
            .await?;

        let mut session =
            AutoTestSession::new(response.session_id.clone(), config.difficulty, config.max_turns);
        session.status = AutoTestStatus::Running;

        let state = Arc::new(RwLock::new(session));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(drive_polls(
            self.runtime.clone(),
            response.session_id.clone(),
            state.clone(),
            self.polling.auto_test_interval(),
            self.polling.max_poll_failures.max(1),
            stop_rx,
        ));

        info!(
            session_id = %response.session_id,
            difficulty = %config.difficulty,
            max_turns = config.max_turns,
            "Auto-test running"
        );

        Ok(AutoTestRun {
            session_id: response.session_id,
            state,
            runtime: self.runtime.clone(),
            stop_tx,
            task: Some(task),
        })
    }
}

async fn drive_polls(
    runtime: Arc<dyn AgentRuntime>,
    session_id: String,
    state: Arc<RwLock<AutoTestSession>>,
    period: Duration,
    max_failures: u32,
    mut stop: watch::Receiver<bool>,
) {
    let polls = poll_until_terminal(period, || {
        let runtime = runtime.clone();
        let session_id = session_id.clone();
        async move { runtime.auto_test_status(session_id).await }
    });
    tokio::pin!(polls);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!(session_id = %session_id, "Auto-test poll stopped");
                break;
            }
            next = polls.next() => match next {
                None => break,
                Some(Ok(snapshot)) => {
                    let mut session = state.write().await;
                    if !session.apply_status(snapshot) || session.is_terminal() {
                        info!(
                            session_id = %session_id,
                            status = %session.status,
                            polls = session.polls,
                            turns = session.conversation_log.len(),
                            "Auto-test finished"
                        );
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "Auto-test poll failed");
                    let mut session = state.write().await;
                    if session.record_failure(&e, max_failures) {
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a running simulation. Dropping it aborts the poll.
pub struct AutoTestRun {
    session_id: String,
    state: Arc<RwLock<AutoTestSession>>,
    runtime: Arc<dyn AgentRuntime>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AutoTestRun {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn snapshot(&self) -> AutoTestSession {
        self.state.read().await.clone()
    }

    /// Whether the poll loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the run. The local status is `stopped` when this returns, even
    /// if the remote stop fails.
    pub async fn stop(&self) -> AutoTestSession {
        let changed = self.state.write().await.mark_stopped();
        let _ = self.stop_tx.send(true);

        if changed {
            info!(session_id = %self.session_id, "Auto-test stopped");
            if let Err(e) = self.runtime.stop_auto_test(self.session_id.clone()).await {
                warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "Remote auto-test stop failed"
                );
            }
        }
        self.snapshot().await
    }

    /// Wait for the poll loop to exit and return the final snapshot.
    pub async fn wait(&mut self) -> AutoTestSession {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(session_id = %self.session_id, error = %e, "Auto-test poll task failed");
                }
            }
        }
        self.snapshot().await
    }
}

impl Drop for AutoTestRun {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
