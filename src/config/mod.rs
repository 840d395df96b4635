use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub graph: GraphConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub polling: PollingConfig,
    pub repair: RepairConfig,
}

/// Agent runtime connection configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub agent_id: String,
    /// Passed through as a bearer token when present
    pub api_key: Option<String>,
}

/// Location of the exported agent graph
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub path: Option<PathBuf>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
///
/// `timeout_ms` is deliberately optional: when unset, non-streaming calls
/// have no deadline and a stalled call is only resolved by cancellation.
/// The repair stream never gets a deadline.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Auto-test polling configuration
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub auto_test_interval_ms: u64,
    pub max_auto_test_turns: u32,
    pub max_poll_failures: u32,
}

/// Repair loop limits
#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub max_iterations: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let runtime = RuntimeConfig {
            base_url: env::var("AGENT_RUNTIME_URL")
                .unwrap_or_else(|_| "http://localhost:8000/api".to_string()),
            agent_id: env::var("AGENT_ID").map_err(|_| AppError::Config {
                message: "AGENT_ID is required".to_string(),
            })?,
            api_key: env::var("AGENT_RUNTIME_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
        };

        let graph = GraphConfig {
            path: env::var("AGENT_GRAPH_PATH").ok().map(PathBuf::from),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/flow-tests.db".to_string()),
            ),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS").filter(|ms| *ms > 0),
            connect_timeout_ms: parse_var("CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            max_retries: parse_var("MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay_ms: parse_var("RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
        };

        let defaults = PollingConfig::default();
        let polling = PollingConfig {
            auto_test_interval_ms: parse_var("AUTO_TEST_POLL_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.auto_test_interval_ms),
            max_auto_test_turns: parse_var("AUTO_TEST_MAX_TURNS")
                .unwrap_or(defaults.max_auto_test_turns),
            max_poll_failures: parse_var("AUTO_TEST_MAX_POLL_FAILURES")
                .unwrap_or(defaults.max_poll_failures),
        };

        let repair = RepairConfig {
            max_iterations: parse_var("REPAIR_MAX_ITERATIONS")
                .unwrap_or(RepairConfig::default().max_iterations),
        };

        Ok(Config {
            runtime,
            graph,
            database,
            logging,
            request,
            polling,
            repair,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl RequestConfig {
    /// Per-request deadline for non-streaming calls, if one is configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl PollingConfig {
    /// Cadence of the auto-test status poll
    pub fn auto_test_interval(&self) -> Duration {
        Duration::from_millis(self.auto_test_interval_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            connect_timeout_ms: 10_000,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            auto_test_interval_ms: 1000,
            max_auto_test_turns: 50,
            max_poll_failures: 5,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_iterations: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_have_no_timeout() {
        let config = RequestConfig::default();
        assert!(config.timeout().is_none());
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_polling_default_cadence_is_one_second() {
        let config = PollingConfig::default();
        assert_eq!(config.auto_test_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_request_timeout_when_configured() {
        let config = RequestConfig {
            timeout_ms: Some(2500),
            ..RequestConfig::default()
        };
        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
    }
}
