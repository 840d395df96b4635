//! # Flow Test Orchestrator
//!
//! Test, auto-test and repair orchestration for node-graph conversational
//! voice agents. The agent itself runs remotely; this crate drives it.
//!
//! ## Features
//!
//! - **Manual testing**: turn-by-turn sessions with transition assertions
//!   and automatic restart of expired remote sessions
//! - **Prompt overrides**: per-node prompt text substituted for test turns
//! - **Auto-test**: simulated callers (compliant, skeptical, hostile) polled
//!   until they finish
//! - **Repair**: streamed fix-and-retest loops whose proposed changes are
//!   applied or discarded explicitly
//! - **Run history**: finished runs recorded in SQLite
//!
//! ## Architecture
//!
//! ```text
//! UI → Console (JSON-RPC, stdio) → Orchestrators → Agent runtime (HTTP + SSE)
//!                                      ↓
//!                                SQLite (history)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flow_test_orchestrator::{AppState, Config, ConsoleServer};
//! use flow_test_orchestrator::graph::NodeGraph;
//! use flow_test_orchestrator::runtime::AgentRuntimeClient;
//! use flow_test_orchestrator::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let graph = NodeGraph::load(std::path::Path::new("agent.json"))?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let runtime = AgentRuntimeClient::new(&config.runtime, config.request.clone())?;
//!     let state = AppState::new(config, Arc::new(graph), Arc::new(runtime), Arc::new(storage));
//!     ConsoleServer::new(Arc::new(state)).run().await?;
//!     Ok(())
//! }
//! ```

/// Simulated-caller runs and their status poll.
pub mod autotest;
/// Configuration management.
pub mod config;
/// JSON-RPC console and request handling.
pub mod console;
/// Error types and result aliases for the application.
pub mod error;
/// The agent's conversation graph.
pub mod graph;
/// Per-node prompt overrides for test turns.
pub mod overrides;
/// Poll-until-terminal stream.
pub mod polling;
/// Automated repair runs.
pub mod repair;
/// Agent runtime client, wire types and stream decoding.
pub mod runtime;
/// Manual test sessions.
pub mod session;
/// SQLite run history.
pub mod storage;

pub use config::Config;
pub use console::{AppState, ConsoleServer, SharedState};
pub use error::{AppError, AppResult};
