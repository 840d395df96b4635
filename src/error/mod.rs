use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Agent runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Console error: {0}")]
    Console(#[from] ConsoleError),
}

/// Errors raised while loading or building the node graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Failed to read graph file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse graph: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate node id: {node_id}")]
    DuplicateNode { node_id: String },

    #[error("Node has an empty id")]
    EmptyNodeId,
}

/// Input rejected locally, before any network call
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation failed: {field} - {reason}")]
    Field { field: String, reason: String },

    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    #[error("No nodes selected")]
    NoNodesSelected,

    #[error("Test response for node {node_id} cannot be empty")]
    EmptyResponse { node_id: String },

    #[error("Expected {expected} test responses, got {actual}")]
    ResponseCountMismatch { expected: usize, actual: usize },
}

/// Agent runtime (remote collaborator) errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Agent runtime unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Remote error: {message}")]
    Remote { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Stream error: {message}")]
    Stream { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Session lifecycle errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {key}")]
    NotFound { key: String },

    #[error("A turn is already in flight for session {key}")]
    TurnInFlight { key: String },

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Fixes already applied for session {session_id}")]
    AlreadyApplied { session_id: String },

    #[error("No fixed graph available for session {session_id}")]
    NothingToApply { session_id: String },

    #[error("Session restart failed: {message}")]
    RestartFailed { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// JSON-RPC console errors
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid parameters for {method}: {message}")]
    InvalidParameters { method: String, message: String },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether the remote side reported that the session no longer exists
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, RuntimeError::SessionNotFound { .. })
    }
}

impl ConsoleError {
    /// JSON-RPC error code for this error
    pub fn code(&self) -> i32 {
        match self {
            ConsoleError::InvalidRequest { .. } => -32600,
            ConsoleError::UnknownMethod { .. } => -32601,
            ConsoleError::InvalidParameters { .. } => -32602,
            ConsoleError::ExecutionFailed { .. } => -32000,
            ConsoleError::Json(_) => -32603,
        }
    }
}

impl From<AppError> for ConsoleError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(e) => ConsoleError::InvalidParameters {
                method: "validation".to_string(),
                message: e.to_string(),
            },
            AppError::Console(e) => e,
            other => ConsoleError::ExecutionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for agent runtime calls
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for console operations
pub type ConsoleResult<T> = Result<T, ConsoleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::EmptyResponse {
            node_id: "qualify".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Test response for node qualify cannot be empty"
        );

        let err = ValidationError::NoNodesSelected;
        assert_eq!(err.to_string(), "No nodes selected");

        let err = ValidationError::ResponseCountMismatch {
            expected: 2,
            actual: 1,
        };
        assert_eq!(err.to_string(), "Expected 2 test responses, got 1");
    }

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::Api {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 500 - boom");

        let err = RuntimeError::SessionNotFound {
            session_id: "sess-1".to_string(),
        };
        assert_eq!(err.to_string(), "Session not found: sess-1");
        assert!(err.is_session_not_found());

        let err = RuntimeError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
        assert!(!err.is_session_not_found());
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::AlreadyApplied {
            session_id: "rep-1".to_string(),
        };
        assert_eq!(err.to_string(), "Fixes already applied for session rep-1");

        let err = SessionError::InvalidState {
            expected: "success".to_string(),
            actual: "testing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state: expected success, found testing"
        );
    }

    #[test]
    fn test_validation_converts_to_app_error() {
        let app_err: AppError = ValidationError::NoNodesSelected.into();
        assert!(matches!(app_err, AppError::Validation(_)));
    }

    #[test]
    fn test_app_error_conversion_to_console_error() {
        let app_err: AppError = ValidationError::NoNodesSelected.into();
        let console_err: ConsoleError = app_err.into();
        assert_eq!(console_err.code(), -32602);

        let app_err: AppError = RuntimeError::Remote {
            message: "down".to_string(),
        }
        .into();
        let console_err: ConsoleError = app_err.into();
        assert_eq!(console_err.code(), -32000);
        assert!(console_err.to_string().contains("down"));
    }

    #[test]
    fn test_console_error_codes() {
        let err = ConsoleError::UnknownMethod {
            method: "nope".to_string(),
        };
        assert_eq!(err.code(), -32601);
        assert_eq!(err.to_string(), "Unknown method: nope");
    }
}
