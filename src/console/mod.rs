//! JSON-RPC console used by the surrounding UI.
//!
//! This module provides:
//! - Line-delimited JSON-RPC 2.0 over stdio
//! - Method routing to the session, auto-test and repair orchestrators
//! - Shared application state with the live session registries

mod handlers;
mod rpc;

pub use handlers::dispatch;
pub use rpc::*;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::autotest::{AutoTestRun, AutoTestSimulator};
use crate::config::Config;
use crate::graph::NodeGraph;
use crate::overrides::OverrideStore;
use crate::repair::{RepairOrchestrator, RepairRun};
use crate::runtime::AgentRuntime;
use crate::session::{TestSession, TestSessionManager};
use crate::storage::{RunKind, RunRecord, RunStore};

/// Finished, recorded auto-test and repair runs kept for status calls.
/// Older ones are evicted; their history rows remain.
pub const RETAINED_FINISHED_RUNS: usize = 16;

/// Application state shared across handlers.
///
/// Owns the immutable graph, the runtime collaborator and every live
/// session, keyed by the id handed back to the UI.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// The agent's conversation graph.
    pub graph: Arc<NodeGraph>,
    /// Agent runtime collaborator.
    pub runtime: Arc<dyn AgentRuntime>,
    /// Run history.
    pub storage: Arc<dyn RunStore>,
    /// Prompt overrides applied to manual test turns.
    pub overrides: RwLock<OverrideStore>,
    /// Manual test session manager.
    pub sessions: TestSessionManager,
    /// Simulated-caller launcher.
    pub simulator: AutoTestSimulator,
    /// Repair launcher.
    pub repairs: RepairOrchestrator,
    test_sessions: RwLock<HashMap<String, Arc<Mutex<TestSession>>>>,
    auto_tests: RwLock<HashMap<String, Arc<AutoTestRun>>>,
    repair_runs: RwLock<HashMap<String, Arc<RepairRun>>>,
    recorded: Mutex<HashSet<String>>,
    /// Recorded runs in the order they finished
    finished: Mutex<VecDeque<(RunKind, String)>>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        graph: Arc<NodeGraph>,
        runtime: Arc<dyn AgentRuntime>,
        storage: Arc<dyn RunStore>,
    ) -> Self {
        info!(
            nodes = graph.len(),
            agent_id = %config.runtime.agent_id,
            "Console state initializing"
        );

        let sessions = TestSessionManager::new(runtime.clone(), graph.clone());
        let simulator =
            AutoTestSimulator::new(runtime.clone(), graph.clone(), config.polling.clone());
        let repairs = RepairOrchestrator::new(runtime.clone(), graph.clone(), config.repair.clone());

        Self {
            overrides: RwLock::new(OverrideStore::new(graph.clone())),
            config,
            graph,
            runtime,
            storage,
            sessions,
            simulator,
            repairs,
            test_sessions: RwLock::new(HashMap::new()),
            auto_tests: RwLock::new(HashMap::new()),
            repair_runs: RwLock::new(HashMap::new()),
            recorded: Mutex::new(HashSet::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    /// Write a run to history unless `key` was already recorded.
    ///
    /// History is secondary to the console's answer, so a storage failure
    /// is logged and the key is left unrecorded for a later attempt.
    pub(crate) async fn record_once(
        &self,
        key: &str,
        kind: RunKind,
        session_id: &str,
        status: &str,
        summary: serde_json::Value,
    ) {
        {
            let mut recorded = self.recorded.lock().await;
            if recorded.contains(key) {
                return;
            }

            let record = RunRecord::new(kind, session_id, status, summary);
            if let Err(e) = self.storage.record_run(&record).await {
                warn!(key = %key, kind = %kind, error = %e, "Failed to record run");
                return;
            }
            recorded.insert(key.to_string());
        }

        if kind != RunKind::TestSession {
            self.retain_finished(kind, key).await;
        }
    }

    async fn retain_finished(&self, kind: RunKind, key: &str) {
        let evicted = {
            let mut finished = self.finished.lock().await;
            finished.push_back((kind, key.to_string()));
            if finished.len() > RETAINED_FINISHED_RUNS {
                finished.pop_front()
            } else {
                None
            }
        };

        if let Some((kind, key)) = evicted {
            debug!(key = %key, kind = %kind, "Evicting finished run");
            self.forget(kind, &key).await;
        }
    }

    /// Drop a live entry and its bookkeeping. Returns whether it existed.
    pub(crate) async fn forget(&self, kind: RunKind, key: &str) -> bool {
        let removed = match kind {
            RunKind::TestSession => self.test_sessions.write().await.remove(key).is_some(),
            RunKind::AutoTest => self.auto_tests.write().await.remove(key).is_some(),
            RunKind::Repair => self.repair_runs.write().await.remove(key).is_some(),
        };

        let prefix = format!("{}:", key);
        self.recorded
            .lock()
            .await
            .retain(|k| k != key && !k.starts_with(&prefix));
        self.finished
            .lock()
            .await
            .retain(|(k, entry)| !(*k == kind && entry == key));
        removed
    }

    /// Number of live entries of `kind`.
    pub async fn live_count(&self, kind: RunKind) -> usize {
        match kind {
            RunKind::TestSession => self.test_sessions.read().await.len(),
            RunKind::AutoTest => self.auto_tests.read().await.len(),
            RunKind::Repair => self.repair_runs.read().await.len(),
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
