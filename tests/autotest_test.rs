//! End-to-end tests for simulated-caller runs
//!
//! Drives `AutoTestSimulator` through the real HTTP client against a
//! wiremock runtime with a short poll interval.

use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

use flow_test_orchestrator::autotest::{AutoTestConfig, AutoTestSimulator};
use flow_test_orchestrator::config::{PollingConfig, RequestConfig, RuntimeConfig};
use flow_test_orchestrator::graph::{Node, NodeGraph};
use flow_test_orchestrator::runtime::{
    AgentRuntime, AgentRuntimeClient, AutoTestStatus, Difficulty,
};

fn simulator(base_url: &str) -> AutoTestSimulator {
    let config = RuntimeConfig {
        base_url: base_url.to_string(),
        agent_id: "agent-1".to_string(),
        api_key: None,
    };
    let request = RequestConfig {
        max_retries: 0,
        ..RequestConfig::default()
    };
    let runtime: Arc<dyn AgentRuntime> =
        Arc::new(AgentRuntimeClient::new(&config, request).expect("Failed to create client"));
    let graph = Arc::new(
        NodeGraph::from_nodes(vec![
            Node::new("greeting").with_auto_transition("goodbye"),
            Node::new("goodbye"),
        ])
        .expect("valid graph"),
    );
    let polling = PollingConfig {
        auto_test_interval_ms: 5,
        max_auto_test_turns: 50,
        max_poll_failures: 3,
    };
    AutoTestSimulator::new(runtime, graph, polling)
}

async fn mount_start(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/agents/agent-1/auto-test/start"))
        .and(body_partial_json(json!({ "difficulty": "hostile", "maxTurns": 10 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "a1" })))
        .expect(1)
        .mount(server)
        .await;
}

fn conversation(turns: usize) -> serde_json::Value {
    let turns: Vec<_> = (0..turns)
        .map(|i| {
            json!({
                "role": if i % 2 == 0 { "agent" } else { "caller" },
                "content": format!("turn {}", i),
                "nodeId": "greeting"
            })
        })
        .collect();
    json!(turns)
}

#[tokio::test]
async fn test_hostile_run_polls_until_completed() {
    let mock_server = MockServer::start().await;
    mount_start(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/agents/agent-1/auto-test/status/a1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "running",
            "conversation": conversation(4)
        })))
        .up_to_n_times(10)
        .expect(10)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/agents/agent-1/auto-test/status/a1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "conversation": conversation(10),
            "nodeTransitions": [{ "from": "greeting", "to": "goodbye" }]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let simulator = simulator(&mock_server.uri());
    let mut run = simulator
        .start(AutoTestConfig::new(Difficulty::Hostile, 10))
        .await
        .unwrap();
    assert_eq!(run.session_id(), "a1");

    let session = run.wait().await;

    assert_eq!(session.status, AutoTestStatus::Completed);
    assert_eq!(session.polls, 11);
    assert_eq!(session.conversation_log.len(), 10);
    assert!(session.conversation_log.len() <= session.max_turns as usize);
    assert_eq!(session.node_transitions.len(), 1);
    assert!(session.finished_at.is_some());
    assert!(run.is_finished());
}

#[tokio::test]
async fn test_stop_is_sent_once() {
    let mock_server = MockServer::start().await;
    mount_start(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/agents/agent-1/auto-test/status/a1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "running" })))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/auto-test/stop"))
        .and(body_partial_json(json!({ "sessionId": "a1" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let simulator = simulator(&mock_server.uri());
    let mut run = simulator
        .start(AutoTestConfig::new(Difficulty::Hostile, 10))
        .await
        .unwrap();

    let stopped = run.stop().await;
    assert_eq!(stopped.status, AutoTestStatus::Stopped);

    let again = run.stop().await;
    assert_eq!(again.status, AutoTestStatus::Stopped);

    let session = run.wait().await;
    assert_eq!(session.status, AutoTestStatus::Stopped);
}

#[tokio::test]
async fn test_vanished_session_ends_in_error() {
    let mock_server = MockServer::start().await;
    mount_start(&mock_server).await;

    Mock::given(method("GET"))
        .and(path("/agents/agent-1/auto-test/status/a1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let simulator = simulator(&mock_server.uri());
    let mut run = simulator
        .start(AutoTestConfig::new(Difficulty::Hostile, 10))
        .await
        .unwrap();

    let session = run.wait().await;
    assert_eq!(session.status, AutoTestStatus::Error);
    assert!(session
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("a1"));
}

#[tokio::test]
async fn test_out_of_range_turns_never_reach_runtime() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/agents/agent-1/auto-test/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "a1" })))
        .expect(0)
        .mount(&mock_server)
        .await;

    let simulator = simulator(&mock_server.uri());
    assert!(simulator
        .start(AutoTestConfig::new(Difficulty::Compliant, 0))
        .await
        .is_err());
    assert!(simulator
        .start(AutoTestConfig::new(Difficulty::Compliant, 51))
        .await
        .is_err());
    assert!(simulator
        .start(AutoTestConfig::new(Difficulty::Skeptical, 5).with_start_node("nowhere"))
        .await
        .is_err());
}
