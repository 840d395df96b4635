use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::SharedState;
use crate::autotest::{AutoTestConfig, AutoTestRun, AutoTestSession};
use crate::error::{AppError, ConsoleError, ConsoleResult, SessionError};
use crate::graph::{Node, NodeLookup};
use crate::repair::{RepairRequest, RepairRun, RepairSession};
use crate::runtime::Difficulty;
use crate::session::{TestSession, TurnOutcome, TurnRequest};
use crate::storage::{RunKind, RunStore};

/// Route a console method to its handler
pub async fn dispatch(
    state: &SharedState,
    method: &str,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    info!(method = %method, "Routing console call");

    match method {
        "graph.lookup" => handle_graph_lookup(state, params).await,
        "graph.transitions" => handle_graph_transitions(state, params).await,
        "overrides.set" => handle_overrides_set(state, params).await,
        "overrides.clear" => handle_overrides_clear(state, params).await,
        "overrides.list" => handle_overrides_list(state).await,
        "test.start" => handle_test_start(state, params).await,
        "test.send" => handle_test_send(state, params).await,
        "test.reset" => handle_test_reset(state, params).await,
        "test.get" => handle_test_get(state, params).await,
        "test.close" => handle_test_close(state, params).await,
        "auto_test.start" => handle_auto_test_start(state, params).await,
        "auto_test.status" => handle_auto_test_status(state, params).await,
        "auto_test.stop" => handle_auto_test_stop(state, params).await,
        "auto_test.forget" => handle_auto_test_forget(state, params).await,
        "repair.start" => handle_repair_start(state, params).await,
        "repair.status" => handle_repair_status(state, params).await,
        "repair.cancel" => handle_repair_cancel(state, params).await,
        "repair.apply" => handle_repair_apply(state, params).await,
        "repair.discard" => handle_repair_discard(state, params).await,
        "repair.forget" => handle_repair_forget(state, params).await,
        "history.list" => handle_history_list(state, params).await,
        _ => Err(ConsoleError::UnknownMethod {
            method: method.to_string(),
        }),
    }
}

// ============================================================================
// Graph and overrides
// ============================================================================

#[derive(Serialize)]
struct NodeRef {
    id: String,
    label: String,
}

impl NodeRef {
    fn of(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            label: node.display_label().to_string(),
        }
    }
}

fn node_refs(nodes: Vec<&Node>) -> Vec<NodeRef> {
    nodes.into_iter().map(NodeRef::of).collect()
}

async fn handle_graph_lookup(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct LookupParams {
        key: String,
    }

    let params: LookupParams = parse_arguments("graph.lookup", params)?;
    let lookup = state.graph.find_by_id_or_label(params.key.trim());

    let (matched, candidates) = match &lookup {
        NodeLookup::ById(_) => ("by_id", Vec::new()),
        NodeLookup::ByLabel(_) => ("by_label", Vec::new()),
        NodeLookup::Ambiguous(nodes) => ("ambiguous", node_refs(nodes.clone())),
        NodeLookup::NotFound => ("not_found", Vec::new()),
    };
    let node = lookup.node();
    let transitions = node
        .map(|n| node_refs(state.graph.transitions_from(Some(&n.id))))
        .unwrap_or_default();

    Ok(json!({
        "match": matched,
        "node": node,
        "label": node.map(Node::display_label),
        "candidates": candidates,
        "transitions": transitions,
    }))
}

async fn handle_graph_transitions(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    #[derive(Deserialize, Default)]
    struct TransitionParams {
        node_id: Option<String>,
    }

    let params: TransitionParams = parse_optional_arguments("graph.transitions", params)?;
    let node_id = params.node_id.as_deref();

    Ok(json!({
        "node_id": node_id,
        "transitions": node_refs(state.graph.transitions_from(node_id)),
        "edges": node_id.map(|id| state.graph.edges_from(id)).unwrap_or_default(),
    }))
}

async fn handle_overrides_set(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct SetParams {
        node_id: String,
        text: String,
    }

    let params: SetParams = parse_arguments("overrides.set", params)?;
    let mut overrides = state.overrides.write().await;
    overrides
        .set(&params.node_id, params.text)
        .map_err(AppError::from)?;

    Ok(json!({ "overrides": overrides.as_map() }))
}

async fn handle_overrides_clear(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    #[derive(Deserialize, Default)]
    struct ClearParams {
        node_id: Option<String>,
    }

    let params: ClearParams = parse_optional_arguments("overrides.clear", params)?;
    let mut overrides = state.overrides.write().await;
    let cleared = match params.node_id {
        Some(node_id) => overrides.clear(&node_id),
        None => {
            let had_any = !overrides.is_empty();
            overrides.clear_all();
            had_any
        }
    };

    Ok(json!({ "cleared": cleared, "overrides": overrides.as_map() }))
}

async fn handle_overrides_list(state: &SharedState) -> ConsoleResult<Value> {
    let overrides = state.overrides.read().await;
    Ok(json!({ "overrides": overrides.as_map() }))
}

// ============================================================================
// Manual test sessions
// ============================================================================

#[derive(Deserialize)]
struct SessionKeyParams {
    key: String,
}

fn session_view(state: &SharedState, session: &TestSession) -> ConsoleResult<Value> {
    let available = node_refs(state.graph.transitions_from(session.current_node_id()));
    Ok(json!({
        "session": serde_json::to_value(session)?,
        "available_transitions": available,
    }))
}

async fn find_test_session(
    state: &SharedState,
    key: &str,
) -> ConsoleResult<Arc<Mutex<TestSession>>> {
    state
        .test_sessions
        .read()
        .await
        .get(key)
        .cloned()
        .ok_or_else(|| {
            AppError::from(SessionError::NotFound {
                key: key.to_string(),
            })
            .into()
        })
}

async fn handle_test_start(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct StartParams {
        start_node_id: Option<String>,
        /// Open the remote session now instead of on the first message
        #[serde(default = "default_open")]
        open: bool,
    }

    fn default_open() -> bool {
        true
    }

    let params: StartParams = parse_optional_arguments_or("test.start", params, || StartParams {
        start_node_id: None,
        open: true,
    })?;

    let session = if params.open {
        state.sessions.start(params.start_node_id.as_deref()).await?
    } else {
        state
            .sessions
            .new_session(params.start_node_id.as_deref())
            .map_err(AppError::from)?
    };

    let view = session_view(state, &session)?;
    state
        .test_sessions
        .write()
        .await
        .insert(session.key().to_string(), Arc::new(Mutex::new(session)));
    Ok(view)
}

async fn handle_test_send(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct SendParams {
        key: String,
        message: String,
        expected_next_node_id: Option<String>,
    }

    let params: SendParams = parse_arguments("test.send", params)?;
    let handle = find_test_session(state, &params.key).await?;
    let mut session = handle.try_lock().map_err(|_| {
        AppError::from(SessionError::TurnInFlight {
            key: params.key.clone(),
        })
    })?;

    // Snapshot so override edits are not blocked behind a slow turn.
    let overrides = state.overrides.read().await.clone();
    let turn = TurnRequest {
        message: params.message,
        expected_next_node_id: params.expected_next_node_id,
    };
    let outcome = state.sessions.send_turn(&mut session, turn, &overrides).await?;

    let summary = match &outcome {
        TurnOutcome::Completed(result) => result.assertion.as_ref().map(|a| a.summary()),
        TurnOutcome::Restarted { .. } => None,
    };
    let outcome = serde_json::to_value(&outcome)?;
    let view = session_view(state, &session)?;

    Ok(json!({
        "outcome": outcome,
        "summary": summary,
        "view": view,
    }))
}

async fn record_test_session(
    state: &SharedState,
    session: &TestSession,
    status: &str,
) -> ConsoleResult<()> {
    if session.turn() == 0 {
        return Ok(());
    }
    let record_key = format!(
        "{}:{}",
        session.key(),
        session.session_id().unwrap_or_default()
    );
    state
        .record_once(
            &record_key,
            RunKind::TestSession,
            session.session_id().unwrap_or(session.key()),
            status,
            serde_json::to_value(session)?,
        )
        .await;
    Ok(())
}

async fn handle_test_reset(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: SessionKeyParams = parse_arguments("test.reset", params)?;
    let handle = find_test_session(state, &params.key).await?;
    let mut session = handle.try_lock().map_err(|_| {
        AppError::from(SessionError::TurnInFlight {
            key: params.key.clone(),
        })
    })?;

    record_test_session(state, &session, "reset").await?;
    state.sessions.reset(&mut session).await?;
    session_view(state, &session)
}

async fn handle_test_get(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: SessionKeyParams = parse_arguments("test.get", params)?;
    let handle = find_test_session(state, &params.key).await?;
    let session = handle.try_lock().map_err(|_| {
        AppError::from(SessionError::TurnInFlight {
            key: params.key.clone(),
        })
    })?;
    session_view(state, &session)
}

async fn handle_test_close(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: SessionKeyParams = parse_arguments("test.close", params)?;
    let handle = find_test_session(state, &params.key).await?;
    {
        let session = handle.try_lock().map_err(|_| {
            AppError::from(SessionError::TurnInFlight {
                key: params.key.clone(),
            })
        })?;
        record_test_session(state, &session, "closed").await?;
    }

    let closed = state.forget(RunKind::TestSession, &params.key).await;
    info!(key = %params.key, "Test session closed");
    Ok(json!({ "closed": closed }))
}

// ============================================================================
// Auto-test
// ============================================================================

#[derive(Deserialize)]
struct AutoTestKeyParams {
    session_id: String,
}

async fn find_auto_test(state: &SharedState, session_id: &str) -> ConsoleResult<Arc<AutoTestRun>> {
    state
        .auto_tests
        .read()
        .await
        .get(session_id)
        .cloned()
        .ok_or_else(|| {
            AppError::from(SessionError::NotFound {
                key: session_id.to_string(),
            })
            .into()
        })
}

async fn record_auto_test(
    state: &SharedState,
    snapshot: &AutoTestSession,
) -> ConsoleResult<Value> {
    let value = serde_json::to_value(snapshot)?;
    if snapshot.is_terminal() {
        state
            .record_once(
                &snapshot.session_id,
                RunKind::AutoTest,
                &snapshot.session_id,
                snapshot.status.as_str(),
                value.clone(),
            )
            .await;
    }
    Ok(value)
}

async fn handle_auto_test_start(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct StartParams {
        difficulty: Difficulty,
        max_turns: u32,
        custom_instructions: Option<String>,
        start_node_id: Option<String>,
    }

    let params: StartParams = parse_arguments("auto_test.start", params)?;
    let run = state
        .simulator
        .start(AutoTestConfig {
            difficulty: params.difficulty,
            max_turns: params.max_turns,
            custom_instructions: params.custom_instructions,
            start_node_id: params.start_node_id,
        })
        .await?;

    let snapshot = run.snapshot().await;
    state
        .auto_tests
        .write()
        .await
        .insert(run.session_id().to_string(), Arc::new(run));
    Ok(serde_json::to_value(snapshot)?)
}

async fn handle_auto_test_status(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    let params: AutoTestKeyParams = parse_arguments("auto_test.status", params)?;
    let run = find_auto_test(state, &params.session_id).await?;
    record_auto_test(state, &run.snapshot().await).await
}

async fn handle_auto_test_stop(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    let params: AutoTestKeyParams = parse_arguments("auto_test.stop", params)?;
    let run = find_auto_test(state, &params.session_id).await?;
    record_auto_test(state, &run.stop().await).await
}

async fn handle_auto_test_forget(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    let params: AutoTestKeyParams = parse_arguments("auto_test.forget", params)?;
    let run = find_auto_test(state, &params.session_id).await?;

    let mut snapshot = run.snapshot().await;
    if !snapshot.is_terminal() {
        snapshot = run.stop().await;
    }
    record_auto_test(state, &snapshot).await?;

    let forgotten = state.forget(RunKind::AutoTest, &params.session_id).await;
    Ok(json!({ "forgotten": forgotten, "status": snapshot.status }))
}

// ============================================================================
// Repair
// ============================================================================

#[derive(Deserialize)]
struct RepairKeyParams {
    key: String,
}

async fn find_repair(state: &SharedState, key: &str) -> ConsoleResult<Arc<RepairRun>> {
    state
        .repair_runs
        .read()
        .await
        .get(key)
        .cloned()
        .ok_or_else(|| {
            AppError::from(SessionError::NotFound {
                key: key.to_string(),
            })
            .into()
        })
}

fn repair_view(session: &RepairSession) -> ConsoleResult<Value> {
    Ok(json!({
        "session": serde_json::to_value(session)?,
        "progress_percent": session.progress_percent(),
        "running": session.is_running(),
        "stalled": session.is_stalled(),
        "applying": session.is_applying(),
    }))
}

async fn record_repair(state: &SharedState, session: &RepairSession) -> ConsoleResult<()> {
    if session.is_terminal() {
        state
            .record_once(
                &session.key,
                RunKind::Repair,
                session.session_id.as_deref().unwrap_or(&session.key),
                session.status.as_str(),
                serde_json::to_value(session)?,
            )
            .await;
    }
    Ok(())
}

async fn handle_repair_start(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize)]
    struct StartParams {
        node_sequence: Vec<String>,
        test_responses: Vec<String>,
        expected_behavior: Option<String>,
        #[serde(default)]
        initial_variables: Map<String, Value>,
        max_iterations: Option<u32>,
    }

    let params: StartParams = parse_arguments("repair.start", params)?;
    let run = state
        .repairs
        .start(RepairRequest {
            node_sequence: params.node_sequence,
            test_responses: params.test_responses,
            expected_behavior: params.expected_behavior,
            initial_variables: params.initial_variables,
            max_iterations: params.max_iterations,
        })
        .await?;

    let key = run.key().to_string();
    let snapshot = run.snapshot().await;
    state
        .repair_runs
        .write()
        .await
        .insert(key.clone(), Arc::new(run));

    let mut view = repair_view(&snapshot)?;
    view["key"] = json!(key);
    Ok(view)
}

async fn handle_repair_status(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: RepairKeyParams = parse_arguments("repair.status", params)?;
    let snapshot = find_repair(state, &params.key).await?.snapshot().await;

    record_repair(state, &snapshot).await?;
    repair_view(&snapshot)
}

async fn handle_repair_cancel(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: RepairKeyParams = parse_arguments("repair.cancel", params)?;
    let snapshot = find_repair(state, &params.key).await?.cancel().await;

    record_repair(state, &snapshot).await?;
    repair_view(&snapshot)
}

async fn handle_repair_apply(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: RepairKeyParams = parse_arguments("repair.apply", params)?;
    let run = find_repair(state, &params.key).await?;

    let response = run.apply_fixes().await?;
    Ok(json!({
        "applied": true,
        "applied_graph": response.applied_graph,
    }))
}

async fn handle_repair_discard(
    state: &SharedState,
    params: Option<Value>,
) -> ConsoleResult<Value> {
    let params: RepairKeyParams = parse_arguments("repair.discard", params)?;
    let run = find_repair(state, &params.key).await?;

    // Keep the final log in history before it is cleared.
    record_repair(state, &run.snapshot().await).await?;
    repair_view(&run.discard().await?)
}

async fn handle_repair_forget(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    let params: RepairKeyParams = parse_arguments("repair.forget", params)?;
    let run = find_repair(state, &params.key).await?;

    let mut snapshot = run.snapshot().await;
    if snapshot.is_running() {
        snapshot = run.cancel().await;
    }
    record_repair(state, &snapshot).await?;

    let forgotten = state.forget(RunKind::Repair, &params.key).await;
    Ok(json!({ "forgotten": forgotten, "status": snapshot.status }))
}

// ============================================================================
// History
// ============================================================================

async fn handle_history_list(state: &SharedState, params: Option<Value>) -> ConsoleResult<Value> {
    #[derive(Deserialize, Default)]
    struct HistoryParams {
        kind: Option<RunKind>,
        limit: Option<u32>,
    }

    let params: HistoryParams = parse_optional_arguments("history.list", params)?;
    let runs = state
        .storage
        .list_runs(params.kind, params.limit.unwrap_or(20).clamp(1, 500))
        .await
        .map_err(AppError::from)?;

    Ok(json!({ "runs": runs }))
}

// ============================================================================
// Argument parsing
// ============================================================================

fn parse_arguments<T: serde::de::DeserializeOwned>(
    method: &str,
    arguments: Option<Value>,
) -> ConsoleResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| ConsoleError::InvalidParameters {
            method: method.to_string(),
            message: e.to_string(),
        }),
        None => Err(ConsoleError::InvalidParameters {
            method: method.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Like [`parse_arguments`], but absent or null params mean "all defaults".
fn parse_optional_arguments<T>(method: &str, arguments: Option<Value>) -> ConsoleResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    parse_optional_arguments_or(method, arguments, T::default)
}

fn parse_optional_arguments_or<T, F>(
    method: &str,
    arguments: Option<Value>,
    default: F,
) -> ConsoleResult<T>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce() -> T,
{
    match arguments {
        None | Some(Value::Null) => Ok(default()),
        Some(args) => parse_arguments(method, Some(args)),
    }
}
