//! Agent runtime collaborator: wire types, HTTP client and the progress
//! stream decoder.
//!
//! The orchestrators only see the [`AgentRuntime`] trait, so tests can
//! substitute a mock and the console can share one client across sessions.

mod client;
pub mod sse;
mod types;

#[cfg(test)]
pub(crate) mod stalling;

pub use client::AgentRuntimeClient;
pub use types::*;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::RuntimeResult;

/// Parsed repair progress frames, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = RuntimeResult<ProgressFrame>> + Send>>;

/// Request/response contracts of the remote agent runtime.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// `POST test/start`
    async fn start_test(&self, request: StartTestRequest) -> RuntimeResult<StartTestResponse>;

    /// `POST test/message`; an expired session is reported as
    /// [`RuntimeError::SessionNotFound`](crate::error::RuntimeError::SessionNotFound).
    async fn send_test_message(
        &self,
        request: TestMessageRequest,
    ) -> RuntimeResult<TestMessageResponse>;

    /// `POST test/reset`
    async fn reset_test(&self, session_id: String) -> RuntimeResult<()>;

    /// `POST auto-test/start`
    async fn start_auto_test(
        &self,
        request: AutoTestStartRequest,
    ) -> RuntimeResult<AutoTestStartResponse>;

    /// `GET auto-test/status/{id}`
    async fn auto_test_status(&self, session_id: String) -> RuntimeResult<AutoTestStatusResponse>;

    /// `POST auto-test/stop`
    async fn stop_auto_test(&self, session_id: String) -> RuntimeResult<()>;

    /// `POST fix-nodes`, returning the open progress stream
    async fn fix_nodes(&self, request: FixNodesRequest) -> RuntimeResult<FrameStream>;

    /// `POST fix-nodes/cancel`
    async fn cancel_fix(&self, session_id: String) -> RuntimeResult<()>;

    /// `POST apply-fixed-nodes`
    async fn apply_fixed_nodes(
        &self,
        request: ApplyFixedNodesRequest,
    ) -> RuntimeResult<ApplyFixedNodesResponse>;
}
