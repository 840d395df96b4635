//! Run history.
//!
//! Finished test sessions, auto-test runs and repair runs are recorded as
//! [`RunRecord`]s so their outcome (including the final progress log of a
//! repair) can be inspected after the console has forgotten them.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Which orchestrator produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// A manual test session, recorded on reset.
    TestSession,
    /// A simulated-caller run.
    AutoTest,
    /// A repair run.
    Repair,
}

impl RunKind {
    /// Column value for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::TestSession => "test_session",
            RunKind::AutoTest => "auto_test",
            RunKind::Repair => "repair",
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "test_session" | "test" => Ok(RunKind::TestSession),
            "auto_test" | "autotest" => Ok(RunKind::AutoTest),
            "repair" => Ok(RunKind::Repair),
            _ => Err(format!("Unknown run kind: {}", s)),
        }
    }
}

/// Outcome of one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique record identifier.
    pub id: String,
    /// Which orchestrator produced the run.
    pub kind: RunKind,
    /// Remote session id, or the local key when none was assigned.
    pub session_id: String,
    /// Final status as reported by the run.
    pub status: String,
    /// Serialized final snapshot.
    pub summary: serde_json::Value,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a record stamped now.
    pub fn new(
        kind: RunKind,
        session_id: impl Into<String>,
        status: impl Into<String>,
        summary: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            session_id: session_id.into(),
            status: status.into(),
            summary,
            created_at: Utc::now(),
        }
    }
}

/// Persistence for run history.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a record.
    async fn record_run(&self, record: &RunRecord) -> StorageResult<()>;
    /// Fetch one record by id.
    async fn get_run(&self, id: &str) -> StorageResult<Option<RunRecord>>;
    /// Most recent records first, optionally filtered by kind.
    async fn list_runs(&self, kind: Option<RunKind>, limit: u32) -> StorageResult<Vec<RunRecord>>;
}
