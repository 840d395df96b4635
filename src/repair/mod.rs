//! Automated repair runs.
//!
//! A run sends the selected node sequence and scripted caller responses to
//! `fix-nodes` and folds the streamed progress frames into a
//! [`RepairSession`]. Proposed changes stay local until [`RepairRun::apply_fixes`]
//! commits the fixed graph; [`RepairRun::discard`] throws them away without
//! touching the network.

mod session;

pub use session::{ProgressEntry, RepairSession, RepairStatus};

use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RepairConfig;
use crate::error::{AppResult, SessionError, ValidationError};
use crate::graph::NodeGraph;
use crate::runtime::{
    AgentRuntime, ApplyFixedNodesRequest, ApplyFixedNodesResponse, FixNodesRequest, FrameStream,
};

/// What to repair and how to exercise it.
#[derive(Debug, Clone, Default)]
pub struct RepairRequest {
    pub node_sequence: Vec<String>,
    pub test_responses: Vec<String>,
    pub expected_behavior: Option<String>,
    pub initial_variables: Map<String, Value>,
    /// Defaults to the configured ceiling
    pub max_iterations: Option<u32>,
}

impl RepairRequest {
    pub fn new(node_sequence: Vec<String>, test_responses: Vec<String>) -> Self {
        Self {
            node_sequence,
            test_responses,
            ..Default::default()
        }
    }

    pub fn with_expected_behavior(mut self, behavior: impl Into<String>) -> Self {
        self.expected_behavior = Some(behavior.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.initial_variables = variables;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }
}

/// Starts repair runs against the agent runtime.
#[derive(Clone)]
pub struct RepairOrchestrator {
    runtime: Arc<dyn AgentRuntime>,
    graph: Arc<NodeGraph>,
    config: RepairConfig,
}

impl RepairOrchestrator {
    pub fn new(runtime: Arc<dyn AgentRuntime>, graph: Arc<NodeGraph>, config: RepairConfig) -> Self {
        Self {
            runtime,
            graph,
            config,
        }
    }

    fn validate(&self, request: &RepairRequest) -> Result<u32, ValidationError> {
        if request.node_sequence.is_empty() {
            return Err(ValidationError::NoNodesSelected);
        }
        if let Some(unknown) = request
            .node_sequence
            .iter()
            .find(|id| !self.graph.contains(id))
        {
            return Err(ValidationError::UnknownNode {
                node_id: unknown.clone(),
            });
        }
        if request.test_responses.len() != request.node_sequence.len() {
            return Err(ValidationError::ResponseCountMismatch {
                expected: request.node_sequence.len(),
                actual: request.test_responses.len(),
            });
        }
        if let Some((node_id, _)) = request
            .node_sequence
            .iter()
            .zip(&request.test_responses)
            .find(|(_, response)| response.trim().is_empty())
        {
            return Err(ValidationError::EmptyResponse {
                node_id: node_id.clone(),
            });
        }

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        if max_iterations == 0 || max_iterations > self.config.max_iterations {
            return Err(ValidationError::Field {
                field: "max_iterations".to_string(),
                reason: format!("must be between 1 and {}", self.config.max_iterations),
            });
        }
        Ok(max_iterations)
    }

    /// Validate, open the progress stream and spawn its reader.
    pub async fn start(&self, request: RepairRequest) -> AppResult<RepairRun> {
        let max_iterations = self.validate(&request)?;

        let frames = self
            .runtime
            .fix_nodes(FixNodesRequest {
                node_ids: request.node_sequence.clone(),
                test_responses: request.test_responses.clone(),
                expected_behavior: request.expected_behavior.clone(),
                initial_variables: request.initial_variables.clone(),
                max_iterations,
            })
            .await?;

        let session = RepairSession::new(
            request.node_sequence,
            request.test_responses,
            request.expected_behavior,
            request.initial_variables,
            max_iterations,
        );
        let key = session.key.clone();
        info!(
            key = %key,
            nodes = session.node_sequence.len(),
            max_iterations,
            "Repair started"
        );

        let state = Arc::new(RwLock::new(session));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(read_frames(
            frames,
            state.clone(),
            self.runtime.clone(),
            cancel_rx,
        ));

        Ok(RepairRun {
            key,
            state,
            runtime: self.runtime.clone(),
            cancel_tx,
            task: Some(task),
        })
    }
}

async fn read_frames(
    mut frames: FrameStream,
    state: Arc<RwLock<RepairSession>>,
    runtime: Arc<dyn AgentRuntime>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut cancelling = false;

    loop {
        tokio::select! {
            _ = cancel.changed(), if !cancelling => {
                // Keep reading until the stream names the run we still owe a cancel.
                if !state.read().await.awaits_remote_id() {
                    break;
                }
                cancelling = true;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    let owed = {
                        let mut session = state.write().await;
                        if session.apply_frame(frame) && session.is_terminal() {
                            info!(
                                key = %session.key,
                                status = %session.status,
                                iteration = session.iteration,
                                "Repair finished"
                            );
                        }
                        session.take_pending_cancel()
                    };
                    if let Some(session_id) = owed {
                        send_remote_cancel(runtime.as_ref(), session_id).await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Repair stream failed");
                    state.write().await.fail(e.to_string());
                    return;
                }
                None => break,
            }
        }
    }

    let mut session = state.write().await;
    session.stream_open = false;
    if session.is_stalled() {
        warn!(key = %session.key, status = %session.status, "Repair stream ended without a result");
    }
    if session.awaits_remote_id() {
        warn!(key = %session.key, "Repair stream ended before its remote id, remote cancel not sent");
    }
}

async fn send_remote_cancel(runtime: &dyn AgentRuntime, session_id: String) {
    if let Err(e) = runtime.cancel_fix(session_id.clone()).await {
        warn!(session_id = %session_id, error = %e, "Remote repair cancel failed");
    }
}

/// Handle to a repair run. Dropping it aborts the stream reader.
pub struct RepairRun {
    key: String,
    state: Arc<RwLock<RepairSession>>,
    runtime: Arc<dyn AgentRuntime>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RepairRun {
    /// Local handle; the remote id arrives with the first frame.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn snapshot(&self) -> RepairSession {
        self.state.read().await.clone()
    }

    /// Whether the stream reader has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the stream reader to exit and return the final snapshot.
    pub async fn wait(&mut self) -> RepairSession {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(key = %self.key, error = %e, "Repair reader task failed");
                }
            }
        }
        self.snapshot().await
    }

    /// Cancel the run. The local status is `cancelled` when this returns;
    /// the remote cancel is best-effort.
    pub async fn cancel(&self) -> RepairSession {
        let (changed, session_id) = {
            let mut session = self.state.write().await;
            (session.mark_cancelled(), session.session_id.clone())
        };
        let _ = self.cancel_tx.send(true);

        if changed {
            info!(key = %self.key, "Repair cancelled");
            match session_id {
                Some(session_id) => send_remote_cancel(self.runtime.as_ref(), session_id).await,
                None => info!(
                    key = %self.key,
                    "No remote id yet, remote cancel deferred to the stream reader"
                ),
            }
        }
        self.snapshot().await
    }

    /// Commit the fixed graph. Only valid once, after `success`.
    ///
    /// The session lock is released during the remote call; a second apply
    /// while one is in flight fails with `InvalidState`.
    pub async fn apply_fixes(&self) -> AppResult<ApplyFixedNodesResponse> {
        let (session_id, fixed_graph) = self.state.write().await.begin_apply()?;

        let result = self
            .runtime
            .apply_fixed_nodes(ApplyFixedNodesRequest { fixed_graph })
            .await;

        self.state.write().await.finish_apply(result.is_ok());
        let response = result?;
        info!(key = %self.key, session_id = %session_id, "Repair fixes applied");
        Ok(response)
    }

    /// Throw away the proposals of a finished or stalled run.
    pub async fn discard(&self) -> AppResult<RepairSession> {
        let mut session = self.state.write().await;
        if session.is_applying() {
            return Err(SessionError::InvalidState {
                expected: "finished".to_string(),
                actual: "applying".to_string(),
            }
            .into());
        }
        if session.is_running() && session.stream_open {
            return Err(SessionError::InvalidState {
                expected: "finished".to_string(),
                actual: session.status.to_string(),
            }
            .into());
        }
        session.discard();
        info!(key = %self.key, "Repair proposals discarded");
        Ok(session.clone())
    }
}

impl Drop for RepairRun {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
