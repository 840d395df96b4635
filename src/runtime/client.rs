use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::sse::decode_frames;
use super::types::{
    ApplyFixedNodesRequest, ApplyFixedNodesResponse, AutoTestStartRequest, AutoTestStartResponse,
    AutoTestStatusResponse, FixNodesRequest, StartTestRequest, StartTestResponse,
    TestMessageRequest, TestMessageResponse,
};
use super::{AgentRuntime, FrameStream};
use crate::config::{RequestConfig, RuntimeConfig};
use crate::error::{RuntimeError, RuntimeResult};

/// HTTP client for the agent runtime test endpoints
#[derive(Clone)]
pub struct AgentRuntimeClient {
    client: Client,
    base_url: String,
    agent_id: String,
    api_key: Option<String>,
    request_config: RequestConfig,
}

impl AgentRuntimeClient {
    /// Create a new agent runtime client
    pub fn new(config: &RuntimeConfig, request_config: RequestConfig) -> RuntimeResult<Self> {
        // No client-wide timeout: it would also cut the repair stream.
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(request_config.connect_timeout_ms))
            .build()
            .map_err(RuntimeError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent_id: config.agent_id.clone(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/agents/{}/{}", self.base_url, self.agent_id, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    /// Attach auth and the optional per-request deadline
    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = self.authorize(builder);
        match self.request_config.timeout() {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    /// Send a request and reject non-2xx responses
    async fn execute(&self, builder: RequestBuilder) -> RuntimeResult<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RuntimeError::Timeout {
                    timeout_ms: self.request_config.timeout_ms.unwrap_or_default(),
                }
            } else {
                RuntimeError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        Ok(response)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> RuntimeResult<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, "POST agent runtime");

        let response = self
            .execute(self.prepare(self.client.post(&url)).json(body))
            .await?;
        parse_body(response, path).await
    }

    /// POST whose response body is only an acknowledgement
    async fn post_ack<B>(&self, path: &str, body: &B) -> RuntimeResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        let url = self.url(path);
        debug!(url = %url, "POST agent runtime (ack)");

        self.execute(self.prepare(self.client.post(&url)).json(body))
            .await?;
        Ok(())
    }

    /// GET with exponential-backoff retries; only used for idempotent reads
    async fn get_json_with_retries<R: DeserializeOwned>(&self, path: &str) -> RuntimeResult<R> {
        let url = self.url(path);

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    path = %path,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying agent runtime request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            let result = match self.execute(self.prepare(self.client.get(&url))).await {
                Ok(response) => parse_body(response, path).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(body) => {
                    debug!(
                        path = %path,
                        latency_ms = start.elapsed().as_millis(),
                        "Agent runtime GET succeeded"
                    );
                    return Ok(body);
                }
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    error!(
                        path = %path,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Agent runtime GET failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(RuntimeError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }
}

async fn parse_body<R: DeserializeOwned>(response: Response, path: &str) -> RuntimeResult<R> {
    response
        .json()
        .await
        .map_err(|e| RuntimeError::InvalidResponse {
            message: format!("Failed to parse {} response: {}", path, e),
        })
}

/// Client errors (4xx) and malformed bodies will not improve on retry
fn is_retryable(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::Api { status, .. } => *status >= 500 || *status == 429,
        RuntimeError::InvalidResponse { .. } | RuntimeError::SessionNotFound { .. } => false,
        _ => true,
    }
}

/// Whether a runtime error message describes a missing or expired session
fn mentions_missing_session(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("session")
        && (message.contains("not found")
            || message.contains("expired")
            || message.contains("does not exist")
            || message.contains("no such"))
}

/// Map runtime responses that mean "this session is gone"
fn session_gone(err: RuntimeError, session_id: &str) -> RuntimeError {
    match err {
        RuntimeError::Api { status: 404, .. } => RuntimeError::SessionNotFound {
            session_id: session_id.to_string(),
        },
        RuntimeError::Api { ref message, .. } if mentions_missing_session(message) => {
            RuntimeError::SessionNotFound {
                session_id: session_id.to_string(),
            }
        }
        other => other,
    }
}

#[async_trait]
impl AgentRuntime for AgentRuntimeClient {
    async fn start_test(&self, request: StartTestRequest) -> RuntimeResult<StartTestResponse> {
        let response: StartTestResponse = self.post_json("test/start", &request).await?;
        info!(
            session_id = %response.session_id,
            start_node = ?request.start_node_id,
            "Test session started"
        );
        Ok(response)
    }

    async fn send_test_message(
        &self,
        request: TestMessageRequest,
    ) -> RuntimeResult<TestMessageResponse> {
        let start = Instant::now();
        let response: TestMessageResponse = self
            .post_json("test/message", &request)
            .await
            .map_err(|e| session_gone(e, &request.session_id))?;

        if let Some(message) = response.error.as_deref().filter(|m| !m.trim().is_empty()) {
            if mentions_missing_session(message) {
                return Err(RuntimeError::SessionNotFound {
                    session_id: request.session_id.clone(),
                });
            }
            return Err(RuntimeError::Remote {
                message: message.to_string(),
            });
        }

        debug!(
            session_id = %request.session_id,
            current_node = ?response.current_node_id,
            latency_ms = start.elapsed().as_millis(),
            "Test message answered"
        );
        Ok(response)
    }

    async fn reset_test(&self, session_id: String) -> RuntimeResult<()> {
        self.post_ack("test/reset", &serde_json::json!({ "sessionId": session_id }))
            .await
    }

    async fn start_auto_test(
        &self,
        request: AutoTestStartRequest,
    ) -> RuntimeResult<AutoTestStartResponse> {
        let response: AutoTestStartResponse = self.post_json("auto-test/start", &request).await?;
        info!(
            session_id = %response.session_id,
            difficulty = %request.difficulty,
            max_turns = request.max_turns,
            "Auto-test started"
        );
        Ok(response)
    }

    async fn auto_test_status(&self, session_id: String) -> RuntimeResult<AutoTestStatusResponse> {
        self.get_json_with_retries(&format!("auto-test/status/{}", session_id))
            .await
            .map_err(|e| session_gone(e, &session_id))
    }

    async fn stop_auto_test(&self, session_id: String) -> RuntimeResult<()> {
        self.post_ack(
            "auto-test/stop",
            &serde_json::json!({ "sessionId": session_id }),
        )
        .await
    }

    async fn fix_nodes(&self, request: FixNodesRequest) -> RuntimeResult<FrameStream> {
        let url = self.url("fix-nodes");
        info!(
            nodes = request.node_ids.len(),
            max_iterations = request.max_iterations,
            "Opening repair stream"
        );

        // Streaming call: never apply the per-request timeout here.
        let builder = self
            .authorize(self.client.post(&url))
            .header("Accept", "text/event-stream")
            .json(&request);
        let response = self.execute(builder).await?;

        Ok(Box::pin(decode_frames(response.bytes_stream())))
    }

    async fn cancel_fix(&self, session_id: String) -> RuntimeResult<()> {
        let url = self.url("fix-nodes/cancel");
        self.execute(
            self.prepare(self.client.post(&url))
                .query(&[("session_id", session_id.as_str())]),
        )
        .await?;
        Ok(())
    }

    async fn apply_fixed_nodes(
        &self,
        request: ApplyFixedNodesRequest,
    ) -> RuntimeResult<ApplyFixedNodesResponse> {
        let response: ApplyFixedNodesResponse =
            self.post_json("apply-fixed-nodes", &request).await?;

        if !response.success {
            return Err(RuntimeError::Remote {
                message: response
                    .error
                    .clone()
                    .unwrap_or_else(|| "apply-fixed-nodes was not accepted".to_string()),
            });
        }

        info!("Fixed nodes applied");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_config(base_url: &str) -> RuntimeConfig {
        RuntimeConfig {
            base_url: base_url.to_string(),
            agent_id: "agent-1".to_string(),
            api_key: None,
        }
    }

    #[test]
    fn test_client_creation_trims_base_url() {
        let client =
            AgentRuntimeClient::new(&runtime_config("http://localhost:8000/api/"), RequestConfig::default())
                .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000/api");
        assert_eq!(
            client.url("test/start"),
            "http://localhost:8000/api/agents/agent-1/test/start"
        );
    }

    #[test]
    fn test_missing_session_detection() {
        assert!(mentions_missing_session("Session not found"));
        assert!(mentions_missing_session("test session expired, start again"));
        assert!(!mentions_missing_session("node not found"));
        assert!(!mentions_missing_session("internal error"));
    }

    #[test]
    fn test_session_gone_mapping() {
        let err = session_gone(
            RuntimeError::Api {
                status: 404,
                message: String::new(),
            },
            "s1",
        );
        assert!(err.is_session_not_found());

        let err = session_gone(
            RuntimeError::Api {
                status: 400,
                message: "{\"detail\":\"Session not found\"}".to_string(),
            },
            "s1",
        );
        assert!(err.is_session_not_found());

        let err = session_gone(
            RuntimeError::Api {
                status: 500,
                message: "boom".to_string(),
            },
            "s1",
        );
        assert!(!err.is_session_not_found());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&RuntimeError::Api {
            status: 503,
            message: String::new()
        }));
        assert!(!is_retryable(&RuntimeError::Api {
            status: 400,
            message: String::new()
        }));
        assert!(!is_retryable(&RuntimeError::InvalidResponse {
            message: String::new()
        }));
    }
}
