use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::runtime::{FrameStatus, NodeChange, ProgressFrame};

/// Lifecycle of a repair run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
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
}

impl RepairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Initializing => "initializing",
            RepairStatus::Analyzing => "analyzing",
            RepairStatus::Testing => "testing",
            RepairStatus::IdentifyingIssues => "identifying_issues",
            RepairStatus::ProposingFix => "proposing_fix",
            RepairStatus::ApplyingFix => "applying_fix",
            RepairStatus::Retesting => "retesting",
            RepairStatus::Success => "success",
            RepairStatus::Failed => "failed",
            RepairStatus::Cancelled => "cancelled",
            RepairStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepairStatus::Success
                | RepairStatus::Failed
                | RepairStatus::Cancelled
                | RepairStatus::Error
        )
    }

    /// Domain status carried by a frame; `None` for markers and unknowns
    fn from_frame(status: FrameStatus) -> Option<Self> {
        match status {
            FrameStatus::Initializing => Some(RepairStatus::Initializing),
            FrameStatus::Analyzing => Some(RepairStatus::Analyzing),
            FrameStatus::Testing => Some(RepairStatus::Testing),
            FrameStatus::IdentifyingIssues => Some(RepairStatus::IdentifyingIssues),
            FrameStatus::ProposingFix => Some(RepairStatus::ProposingFix),
            FrameStatus::ApplyingFix => Some(RepairStatus::ApplyingFix),
            FrameStatus::Retesting => Some(RepairStatus::Retesting),
            FrameStatus::Success => Some(RepairStatus::Success),
            FrameStatus::Failed => Some(RepairStatus::Failed),
            FrameStatus::Cancelled => Some(RepairStatus::Cancelled),
            FrameStatus::Error => Some(RepairStatus::Error),
            FrameStatus::Started | FrameStatus::Complete | FrameStatus::Unknown => None,
        }
    }
}

impl std::fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of the repair progress log
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEntry {
    pub status: FrameStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Local state of one repair run, folded from the progress stream
#[derive(Debug, Clone, Serialize)]
pub struct RepairSession {
    pub key: String,
    pub session_id: Option<String>,
    pub node_sequence: Vec<String>,
    pub test_responses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_behavior: Option<String>,
    pub initial_variables: Map<String, Value>,
    pub max_iterations: u32,
    pub iteration: u32,
    pub status: RepairStatus,
    pub progress_log: Vec<ProgressEntry>,
    pub proposed_node_changes: Vec<NodeChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_graph: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stream_open: bool,
    pub applied: bool,
    pub discarded: bool,
    #[serde(skip)]
    applying: bool,
    /// Cancelled before the remote id arrived
    #[serde(skip)]
    remote_cancel_pending: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RepairSession {
    pub(crate) fn new(
        node_sequence: Vec<String>,
        test_responses: Vec<String>,
        expected_behavior: Option<String>,
        initial_variables: Map<String, Value>,
        max_iterations: u32,
    ) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            session_id: None,
            node_sequence,
            test_responses,
            expected_behavior,
            initial_variables,
            max_iterations,
            iteration: 0,
            status: RepairStatus::Initializing,
            progress_log: Vec::new(),
            proposed_node_changes: Vec::new(),
            fixed_graph: None,
            test_results: None,
            last_error: None,
            stream_open: true,
            applied: false,
            discarded: false,
            applying: false,
            remote_cancel_pending: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal() && !self.discarded
    }

    /// The stream closed without ever reporting a terminal status.
    pub fn is_stalled(&self) -> bool {
        self.is_running() && !self.stream_open
    }

    pub fn progress_percent(&self) -> u32 {
        if self.max_iterations == 0 {
            return 0;
        }
        let percent = u64::from(self.iteration) * 100 / u64::from(self.max_iterations);
        percent.min(100) as u32
    }

    fn finish(&mut self, status: RepairStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Fold one progress frame in. Returns whether it changed the session.
    pub fn apply_frame(&mut self, frame: ProgressFrame) -> bool {
        if frame.status.is_marker() {
            if frame.status == FrameStatus::Started && self.session_id.is_none() {
                self.session_id = frame.session_id;
            }
            return false;
        }

        if self.is_terminal() || self.discarded {
            debug!(
                key = %self.key,
                status = ?frame.status,
                "Draining frame after terminal status"
            );
            return false;
        }

        if self.session_id.is_none() {
            self.session_id = frame.session_id.clone();
        }

        self.progress_log.push(ProgressEntry {
            status: frame.status,
            iteration: frame.iteration,
            message: frame.message.clone(),
            at: Utc::now(),
        });

        if let Some(graph) = frame.fixed_graph() {
            self.fixed_graph = Some(graph.clone());
        }
        if let Some(changes) = frame.node_changes {
            self.proposed_node_changes = changes;
        }
        if let Some(results) = frame.test_results {
            self.test_results = Some(results);
        }

        if let Some(iteration) = frame.iteration {
            if iteration > self.max_iterations {
                warn!(
                    key = %self.key,
                    iteration,
                    max_iterations = self.max_iterations,
                    "Repair exceeded its iteration budget"
                );
                self.iteration = self.max_iterations;
                self.last_error = Some(format!(
                    "Iteration {} exceeds maximum of {}",
                    iteration, self.max_iterations
                ));
                self.finish(RepairStatus::Failed);
                return true;
            }
            self.iteration = iteration;
        }

        match RepairStatus::from_frame(frame.status) {
            Some(status) if status.is_terminal() => {
                if matches!(status, RepairStatus::Error | RepairStatus::Failed) {
                    self.last_error = frame.message;
                }
                self.finish(status);
            }
            Some(status) => self.status = status,
            None => warn!(key = %self.key, "Repair frame with unknown status"),
        }
        true
    }

    /// Transport failure while reading the stream.
    pub(crate) fn fail(&mut self, message: String) {
        self.stream_open = false;
        if self.is_running() {
            self.last_error = Some(message);
            self.finish(RepairStatus::Error);
        }
    }

    pub(crate) fn mark_cancelled(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.stream_open = false;
        self.remote_cancel_pending = self.session_id.is_none();
        self.finish(RepairStatus::Cancelled);
        true
    }

    pub(crate) fn awaits_remote_id(&self) -> bool {
        self.remote_cancel_pending
    }

    /// The remote id owed a cancel, once the stream has reported it.
    pub(crate) fn take_pending_cancel(&mut self) -> Option<String> {
        if !self.remote_cancel_pending {
            return None;
        }
        let session_id = self.session_id.clone()?;
        self.remote_cancel_pending = false;
        Some(session_id)
    }

    pub fn is_applying(&self) -> bool {
        self.applying
    }

    /// Claim the fixed graph for a commit. At most one apply is in flight.
    pub(crate) fn begin_apply(&mut self) -> Result<(String, Value), SessionError> {
        let session_id = self.session_id.clone().unwrap_or_else(|| self.key.clone());

        if self.applied {
            return Err(SessionError::AlreadyApplied { session_id });
        }
        if self.applying {
            return Err(SessionError::InvalidState {
                expected: RepairStatus::Success.to_string(),
                actual: "applying".to_string(),
            });
        }
        if self.status != RepairStatus::Success {
            return Err(SessionError::InvalidState {
                expected: RepairStatus::Success.to_string(),
                actual: self.status.to_string(),
            });
        }
        let fixed_graph = self
            .fixed_graph
            .clone()
            .ok_or_else(|| SessionError::NothingToApply {
                session_id: session_id.clone(),
            })?;

        self.applying = true;
        Ok((session_id, fixed_graph))
    }

    pub(crate) fn finish_apply(&mut self, committed: bool) {
        self.applying = false;
        self.applied |= committed;
    }

    /// Drop everything the run proposed. No network traffic.
    pub(crate) fn discard(&mut self) {
        self.proposed_node_changes.clear();
        self.fixed_graph = None;
        self.test_results = None;
        self.progress_log.clear();
        self.iteration = 0;
        self.status = RepairStatus::Initializing;
        self.finished_at = None;
        self.discarded = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(max_iterations: u32) -> RepairSession {
        RepairSession::new(
            vec!["greeting".to_string(), "qualify".to_string()],
            vec!["hello".to_string(), "yes".to_string()],
            None,
            Map::new(),
            max_iterations,
        )
    }

    fn change(node_id: &str, prompt: &str) -> NodeChange {
        NodeChange {
            node_id: node_id.to_string(),
            new_prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_markers_are_not_logged() {
        let mut s = session(3);
        let mut started = ProgressFrame::new(FrameStatus::Started);
        started.session_id = Some("fix-1".to_string());

        assert!(!s.apply_frame(started));
        assert!(!s.apply_frame(ProgressFrame::new(FrameStatus::Complete)));
        assert_eq!(s.session_id.as_deref(), Some("fix-1"));
        assert!(s.progress_log.is_empty());
    }

    #[test]
    fn test_node_changes_last_writer_wins() {
        let mut s = session(3);
        s.apply_frame(
            ProgressFrame::new(FrameStatus::ProposingFix)
                .with_node_changes(vec![change("greeting", "v1"), change("qualify", "v1")]),
        );
        s.apply_frame(
            ProgressFrame::new(FrameStatus::ProposingFix)
                .with_node_changes(vec![change("greeting", "v2")]),
        );

        assert_eq!(s.proposed_node_changes.len(), 1);
        assert_eq!(s.proposed_node_changes[0].new_prompt, "v2");
        assert_eq!(s.status, RepairStatus::ProposingFix);
    }

    #[test]
    fn test_iteration_over_budget_forces_failed() {
        let mut s = session(2);
        s.apply_frame(ProgressFrame::new(FrameStatus::Testing).with_iteration(2));
        assert_eq!(s.progress_percent(), 100);

        s.apply_frame(ProgressFrame::new(FrameStatus::Retesting).with_iteration(3));
        assert_eq!(s.status, RepairStatus::Failed);
        assert_eq!(s.iteration, 2);
        assert!(s.last_error.is_some());
    }

    #[test]
    fn test_progress_with_large_iteration_budget() {
        let mut s = session(u32::MAX);
        s.apply_frame(ProgressFrame::new(FrameStatus::Testing).with_iteration(u32::MAX / 2));
        assert_eq!(s.progress_percent(), 49);

        s.apply_frame(ProgressFrame::new(FrameStatus::Retesting).with_iteration(u32::MAX));
        assert_eq!(s.progress_percent(), 100);
        assert_eq!(session(0).progress_percent(), 0);
    }

    #[test]
    fn test_frames_after_terminal_are_drained() {
        let mut s = session(3);
        s.apply_frame(ProgressFrame::new(FrameStatus::Success).with_iteration(1));
        let log_len = s.progress_log.len();

        assert!(!s.apply_frame(ProgressFrame::new(FrameStatus::Analyzing).with_iteration(2)));
        assert_eq!(s.status, RepairStatus::Success);
        assert_eq!(s.iteration, 1);
        assert_eq!(s.progress_log.len(), log_len);
    }

    #[test]
    fn test_unknown_status_is_logged_without_transition() {
        let mut s = session(3);
        s.apply_frame(ProgressFrame::new(FrameStatus::Analyzing));
        assert!(s.apply_frame(ProgressFrame::new(FrameStatus::Unknown).with_message("hmm")));
        assert_eq!(s.status, RepairStatus::Analyzing);
        assert_eq!(s.progress_log.len(), 2);
    }

    #[test]
    fn test_fixed_graph_from_details() {
        let mut s = session(3);
        let mut frame = ProgressFrame::new(FrameStatus::Success);
        frame.details = Some(json!({ "fixed_graph": { "nodes": [] } }));
        s.apply_frame(frame);
        assert_eq!(s.fixed_graph, Some(json!({ "nodes": [] })));
    }

    #[test]
    fn test_stalled_and_failed_transport() {
        let mut s = session(3);
        s.apply_frame(ProgressFrame::new(FrameStatus::Testing));
        s.stream_open = false;
        assert!(s.is_stalled());

        let mut s = session(3);
        s.fail("connection reset".to_string());
        assert_eq!(s.status, RepairStatus::Error);
        assert!(!s.is_stalled());
    }

    #[test]
    fn test_cancel_before_remote_id_is_owed() {
        let mut s = session(3);
        assert!(s.mark_cancelled());
        assert!(s.awaits_remote_id());
        assert_eq!(s.take_pending_cancel(), None);

        let mut started = ProgressFrame::new(FrameStatus::Started);
        started.session_id = Some("fix-2".to_string());
        s.apply_frame(started);

        assert_eq!(s.take_pending_cancel().as_deref(), Some("fix-2"));
        assert_eq!(s.take_pending_cancel(), None);
        assert!(!s.awaits_remote_id());
        assert_eq!(s.status, RepairStatus::Cancelled);
    }

    #[test]
    fn test_cancel_with_remote_id_owes_nothing() {
        let mut s = session(3);
        let mut started = ProgressFrame::new(FrameStatus::Started);
        started.session_id = Some("fix-3".to_string());
        s.apply_frame(started);

        assert!(s.mark_cancelled());
        assert!(!s.awaits_remote_id());
        assert_eq!(s.take_pending_cancel(), None);
    }

    #[test]
    fn test_only_one_apply_in_flight() {
        let mut s = session(3);
        s.apply_frame(
            ProgressFrame::new(FrameStatus::Success)
                .with_iteration(1)
                .with_fixed_graph(json!({ "nodes": [] })),
        );

        let (session_id, graph) = s.begin_apply().unwrap();
        assert_eq!(session_id, s.key);
        assert_eq!(graph, json!({ "nodes": [] }));
        assert!(s.is_applying());
        assert!(matches!(
            s.begin_apply(),
            Err(SessionError::InvalidState { .. })
        ));

        // A failed commit can be retried.
        s.finish_apply(false);
        assert!(!s.applied);
        s.begin_apply().unwrap();
        s.finish_apply(true);
        assert!(s.applied);
        assert!(matches!(
            s.begin_apply(),
            Err(SessionError::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_discard_resets_proposals() {
        let mut s = session(3);
        s.apply_frame(
            ProgressFrame::new(FrameStatus::Success)
                .with_iteration(2)
                .with_node_changes(vec![change("greeting", "v1")])
                .with_fixed_graph(json!({ "nodes": [] })),
        );
        s.discard();

        assert_eq!(s.status, RepairStatus::Initializing);
        assert!(s.discarded);
        assert!(s.fixed_graph.is_none());
        assert!(s.proposed_node_changes.is_empty());
        assert!(s.progress_log.is_empty());
        assert!(!s.is_running());
        assert!(!s.mark_cancelled());
    }
}
