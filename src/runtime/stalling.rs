//! Test runtime whose selected calls never return.
//!
//! Delegates every call to a [`MockAgentRuntime`] so expectations still
//! count, then parks the caller for the methods marked as stalled.

use async_trait::async_trait;
use futures::future;

use super::*;
use crate::error::RuntimeResult;

pub(crate) struct StallingRuntime {
    inner: MockAgentRuntime,
    stall_messages: bool,
    stall_apply: bool,
}

impl StallingRuntime {
    pub(crate) fn new(inner: MockAgentRuntime) -> Self {
        Self {
            inner,
            stall_messages: false,
            stall_apply: false,
        }
    }

    /// `send_test_message` never answers
    pub(crate) fn stalling_messages(mut self) -> Self {
        self.stall_messages = true;
        self
    }

    /// `apply_fixed_nodes` never answers
    pub(crate) fn stalling_apply(mut self) -> Self {
        self.stall_apply = true;
        self
    }
}

async fn stall_if(stalled: bool) {
    if stalled {
        future::pending::<()>().await;
    }
}

#[async_trait]
impl AgentRuntime for StallingRuntime {
    async fn start_test(&self, request: StartTestRequest) -> RuntimeResult<StartTestResponse> {
        self.inner.start_test(request).await
    }

    async fn send_test_message(
        &self,
        request: TestMessageRequest,
    ) -> RuntimeResult<TestMessageResponse> {
        let response = self.inner.send_test_message(request).await;
        stall_if(self.stall_messages).await;
        response
    }

    async fn reset_test(&self, session_id: String) -> RuntimeResult<()> {
        self.inner.reset_test(session_id).await
    }

    async fn start_auto_test(
        &self,
        request: AutoTestStartRequest,
    ) -> RuntimeResult<AutoTestStartResponse> {
        self.inner.start_auto_test(request).await
    }

    async fn auto_test_status(&self, session_id: String) -> RuntimeResult<AutoTestStatusResponse> {
        self.inner.auto_test_status(session_id).await
    }

    async fn stop_auto_test(&self, session_id: String) -> RuntimeResult<()> {
        self.inner.stop_auto_test(session_id).await
    }

    async fn fix_nodes(&self, request: FixNodesRequest) -> RuntimeResult<FrameStream> {
        self.inner.fix_nodes(request).await
    }

    async fn cancel_fix(&self, session_id: String) -> RuntimeResult<()> {
        self.inner.cancel_fix(session_id).await
    }

    async fn apply_fixed_nodes(
        &self,
        request: ApplyFixedNodesRequest,
    ) -> RuntimeResult<ApplyFixedNodesResponse> {
        let response = self.inner.apply_fixed_nodes(request).await;
        stall_if(self.stall_apply).await;
        response
    }
}
