//! JSON-RPC 2.0 framing and the stdio loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::{dispatch, SharedState};
use crate::error::ConsoleError;

#[cfg(test)]
#[path = "console_tests.rs"]
mod console_tests;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null when the request could not be parsed).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Console identification returned by `initialize`.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub server_info: ServerInfo,
    pub agent_id: String,
    pub node_count: usize,
    pub methods: Vec<&'static str>,
}

/// Every method the console answers.
pub const METHODS: &[&str] = &[
    "initialize",
    "ping",
    "graph.lookup",
    "graph.transitions",
    "overrides.set",
    "overrides.clear",
    "overrides.list",
    "test.start",
    "test.send",
    "test.reset",
    "test.get",
    "test.close",
    "auto_test.start",
    "auto_test.status",
    "auto_test.stop",
    "auto_test.forget",
    "repair.start",
    "repair.status",
    "repair.cancel",
    "repair.apply",
    "repair.discard",
    "repair.forget",
    "history.list",
];

/// How long in-flight requests may keep running after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Console server speaking JSON-RPC over a line-delimited byte stream.
///
/// Every request runs as its own task, so a slow runtime call never holds
/// up `ping` or a cancel. Responses go through one writer and may arrive
/// out of request order; clients match them by `id`.
#[derive(Clone)]
pub struct ConsoleServer {
    state: SharedState,
}

impl ConsoleServer {
    /// Create a new console server
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Flow test console starting...");
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    /// Serve requests from `reader` until EOF, writing one response line per
    /// request to `writer`.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let mut in_flight = JoinSet::new();
        let mut lines = reader.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("EOF received, shutting down");
                        break;
                    };

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    debug!(request = %trimmed, "Received request");

                    match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                        Ok(request) => {
                            let server = self.clone();
                            let tx = tx.clone();
                            in_flight.spawn(async move {
                                // Notifications get no response
                                if let Some(response) = server.handle_request(request).await {
                                    let _ = tx.send(response);
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to parse request");
                            let _ = tx.send(JsonRpcResponse::error(
                                None,
                                -32700,
                                format!("Parse error: {}", e),
                            ));
                        }
                    }
                }
                Some(response) = rx.recv() => write_response(&mut writer, &response).await?,
                Some(joined) = in_flight.join_next() => log_join(joined),
            }
        }

        drop(tx);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(pending = in_flight.len(), "Abandoning in-flight requests");
            in_flight.abort_all();
        }

        while let Ok(response) = rx.try_recv() {
            write_response(&mut writer, &response).await?;
        }
        Ok(())
    }

    /// Handle a single JSON-RPC request.
    /// Returns None for notifications (requests without id).
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" => {
                debug!("Received initialized notification");
                None
            }
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                let result = dispatch(&self.state, method, request.params).await;
                if is_notification {
                    if let Err(e) = result {
                        debug!(method = %method, error = %e, "Notification failed");
                    }
                    return None;
                }
                Some(match result {
                    Ok(value) => JsonRpcResponse::success(request.id, value),
                    Err(e) => {
                        if matches!(e, ConsoleError::UnknownMethod { .. }) {
                            error!(method = %method, "Unknown method");
                        }
                        JsonRpcResponse::error(request.id, e.code(), e.to_string())
                    }
                })
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            agent_id: self.state.config.runtime.agent_id.clone(),
            node_count: self.state.graph.len(),
            methods: METHODS.to_vec(),
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &JsonRpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response_json = serde_json::to_string(response)?;
    debug!(response = %response_json, "Sending response");

    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Request task panicked");
        }
    }
}
