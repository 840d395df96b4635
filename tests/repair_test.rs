//! End-to-end tests for repair runs
//!
//! Serves the progress stream as a `text/event-stream` body from wiremock and
//! drives `RepairOrchestrator` through the real HTTP client.

use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

use flow_test_orchestrator::config::{RepairConfig, RequestConfig, RuntimeConfig};
use flow_test_orchestrator::error::{AppError, SessionError};
use flow_test_orchestrator::graph::{Node, NodeGraph};
use flow_test_orchestrator::repair::{RepairOrchestrator, RepairRequest, RepairStatus};
use flow_test_orchestrator::runtime::{AgentRuntime, AgentRuntimeClient, FrameStatus};

fn orchestrator(base_url: &str) -> RepairOrchestrator {
    let config = RuntimeConfig {
        base_url: base_url.to_string(),
        agent_id: "agent-1".to_string(),
        api_key: None,
    };
    let runtime: Arc<dyn AgentRuntime> = Arc::new(
        AgentRuntimeClient::new(&config, RequestConfig::default())
            .expect("Failed to create client"),
    );
    let graph = Arc::new(
        NodeGraph::from_nodes(vec![
            Node::new("greeting")
                .with_label("Greeting")
                .with_prompt("Say hello")
                .with_transition("wants to book", "qualify"),
            Node::new("qualify")
                .with_label("Qualify")
                .with_prompt("Ask for a date"),
        ])
        .expect("valid graph"),
    );
    RepairOrchestrator::new(runtime, graph, RepairConfig { max_iterations: 5 })
}

fn request() -> RepairRequest {
    RepairRequest::new(
        vec!["greeting".to_string(), "qualify".to_string()],
        vec!["hi".to_string(), "next tuesday".to_string()],
    )
    .with_expected_behavior("Agent books the appointment")
    .with_max_iterations(3)
}

fn event_stream(frames: &[serde_json::Value]) -> String {
    frames
        .iter()
        .map(|f| format!("data: {}\n\n", f))
        .collect()
}

#[tokio::test]
async fn test_successful_repair_applies_once() {
    let mock_server = MockServer::start().await;

    let fixed_graph = json!({ "nodes": [{ "id": "greeting", "data": { "prompt": "Say hello warmly" } }] });
    let body = event_stream(&[
        json!({ "status": "started", "session_id": "r1" }),
        json!({ "status": "initializing" }),
        json!({ "status": "analyzing", "iteration": 1 }),
        json!({ "status": "testing", "iteration": 1, "message": "Running conversation" }),
        json!({ "status": "identifying_issues", "iteration": 1 }),
        json!({
            "status": "proposing_fix",
            "iteration": 1,
            "node_changes": [{
                "node_id": "greeting",
                "original_prompt": "Say hello",
                "new_prompt": "Say hello warmly",
                "reason": "Greeting too curt"
            }]
        }),
        json!({ "status": "applying_fix", "iteration": 1 }),
        json!({ "status": "retesting", "iteration": 2 }),
        json!({
            "status": "success",
            "iteration": 2,
            "message": "All turns passed",
            "details": { "fixed_graph": fixed_graph.clone() }
        }),
        json!({ "status": "complete" }),
    ]);

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/fix-nodes"))
        .and(body_partial_json(json!({
            "nodeIds": ["greeting", "qualify"],
            "testResponses": ["hi", "next tuesday"],
            "expectedBehavior": "Agent books the appointment",
            "maxIterations": 3
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/apply-fixed-nodes"))
        .and(body_partial_json(json!({ "fixedGraph": fixed_graph.clone() })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "appliedGraph": fixed_graph.clone()
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let orchestrator = orchestrator(&mock_server.uri());
    let mut run = orchestrator.start(request()).await.unwrap();
    let session = run.wait().await;

    assert_eq!(session.status, RepairStatus::Success);
    assert_eq!(session.session_id.as_deref(), Some("r1"));
    assert_eq!(session.iteration, 2);
    let walk: Vec<_> = session.progress_log.iter().map(|e| e.status).collect();
    assert_eq!(
        walk,
        vec![
            FrameStatus::Initializing,
            FrameStatus::Analyzing,
            FrameStatus::Testing,
            FrameStatus::IdentifyingIssues,
            FrameStatus::ProposingFix,
            FrameStatus::ApplyingFix,
            FrameStatus::Retesting,
            FrameStatus::Success,
        ]
    );
    assert_eq!(session.proposed_node_changes.len(), 1);
    assert_eq!(session.proposed_node_changes[0].new_prompt, "Say hello warmly");
    assert_eq!(session.fixed_graph.as_ref(), Some(&fixed_graph));
    assert!(!session.stream_open);

    let applied = run.apply_fixes().await.unwrap();
    assert!(applied.success);
    assert_eq!(applied.applied_graph, Some(fixed_graph));

    let again = run.apply_fixes().await.unwrap_err();
    assert!(matches!(
        again,
        AppError::Session(SessionError::AlreadyApplied { .. })
    ));
    assert!(run.snapshot().await.applied);
}

#[tokio::test]
async fn test_iteration_overrun_fails_the_run() {
    let mock_server = MockServer::start().await;

    let body = event_stream(&[
        json!({ "status": "started", "session_id": "r2" }),
        json!({ "status": "analyzing", "iteration": 3 }),
        json!({ "status": "retesting", "iteration": 4 }),
        json!({ "status": "success", "iteration": 4, "fixed_graph": { "nodes": [] } }),
    ]);

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/fix-nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/apply-fixed-nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(0)
        .mount(&mock_server)
        .await;

    let orchestrator = orchestrator(&mock_server.uri());
    let mut run = orchestrator.start(request()).await.unwrap();
    let session = run.wait().await;

    assert_eq!(session.status, RepairStatus::Failed);
    assert_eq!(session.iteration, 3);
    assert_eq!(session.progress_percent(), 100);
    assert!(session.last_error.is_some());
    assert!(run.apply_fixes().await.is_err());
}

#[tokio::test]
async fn test_stream_without_result_can_be_discarded() {
    let mock_server = MockServer::start().await;

    let body = event_stream(&[
        json!({ "status": "started", "session_id": "r3" }),
        json!({ "status": "analyzing", "iteration": 1 }),
    ]);

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/fix-nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let orchestrator = orchestrator(&mock_server.uri());
    let mut run = orchestrator.start(request()).await.unwrap();
    let session = run.wait().await;

    assert_eq!(session.status, RepairStatus::Analyzing);
    assert!(session.is_stalled());

    let discarded = run.discard().await.unwrap();
    assert!(discarded.discarded);
    assert!(discarded.proposed_node_changes.is_empty());
    assert!(discarded.fixed_graph.is_none());
}

#[tokio::test]
async fn test_rejected_stream_returns_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/fix-nodes"))
        .respond_with(ResponseTemplate::new(500).set_body_string("repair worker offline"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let orchestrator = orchestrator(&mock_server.uri());
    let err = orchestrator.start(request()).await.err().expect("start should fail");

    assert!(matches!(err, AppError::Runtime(_)));
    assert!(err.to_string().contains("repair worker offline"));
}
