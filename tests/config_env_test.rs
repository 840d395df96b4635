//! Config environment variable tests
//!
//! These tests verify that Config::from_env() correctly reads and applies
//! environment variable overrides. Config::from_env() also loads a .env file
//! via dotenvy when one is present, so these tests set every variable they
//! assert on.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use flow_test_orchestrator::config::{Config, LogFormat};
use serial_test::serial;
use std::env;

fn with_agent<F: FnOnce()>(f: F) {
    env::set_var("AGENT_ID", "agent-test");
    f();
    env::remove_var("AGENT_ID");
}

#[test]
#[serial]
fn test_config_requires_agent_id() {
    env::remove_var("AGENT_ID");

    let result = Config::from_env();

    // A .env file in the working directory could still provide it
    if let Err(e) = result {
        assert!(e.to_string().contains("AGENT_ID"));
    }
}

#[test]
#[serial]
fn test_config_from_env_custom_runtime() {
    with_agent(|| {
        env::set_var("AGENT_RUNTIME_URL", "https://runtime.example.com/api");
        env::set_var("AGENT_RUNTIME_API_KEY", "secret");

        let config = Config::from_env().unwrap();
        assert_eq!(config.runtime.base_url, "https://runtime.example.com/api");
        assert_eq!(config.runtime.agent_id, "agent-test");
        assert_eq!(config.runtime.api_key.as_deref(), Some("secret"));

        env::remove_var("AGENT_RUNTIME_URL");
        env::remove_var("AGENT_RUNTIME_API_KEY");
    });
}

#[test]
#[serial]
fn test_config_blank_api_key_is_none() {
    with_agent(|| {
        env::set_var("AGENT_RUNTIME_API_KEY", "   ");

        let config = Config::from_env().unwrap();
        assert!(config.runtime.api_key.is_none());

        env::remove_var("AGENT_RUNTIME_API_KEY");
    });
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    with_agent(|| {
        env::set_var("DATABASE_PATH", "/custom/path.db");
        env::set_var("DATABASE_MAX_CONNECTIONS", "10");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database.path.to_str().unwrap(), "/custom/path.db");
        assert_eq!(config.database.max_connections, 10);

        env::remove_var("DATABASE_PATH");
        env::remove_var("DATABASE_MAX_CONNECTIONS");
    });
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    with_agent(|| {
        env::set_var("LOG_FORMAT", "JSON");

        let config = Config::from_env().unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);

        env::set_var("LOG_FORMAT", "pretty");
    });
}

#[test]
#[serial]
fn test_config_from_env_request_timeout() {
    with_agent(|| {
        env::set_var("REQUEST_TIMEOUT_MS", "60000");
        env::set_var("MAX_RETRIES", "5");
        env::set_var("RETRY_DELAY_MS", "2000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.request.timeout_ms, Some(60000));
        assert_eq!(config.request.max_retries, 5);
        assert_eq!(config.request.retry_delay_ms, 2000);

        // Zero means no per-request deadline
        env::set_var("REQUEST_TIMEOUT_MS", "0");
        let config = Config::from_env().unwrap();
        assert!(config.request.timeout().is_none());

        env::remove_var("REQUEST_TIMEOUT_MS");
        env::remove_var("MAX_RETRIES");
        env::remove_var("RETRY_DELAY_MS");
    });
}

#[test]
#[serial]
fn test_config_from_env_polling_and_repair() {
    with_agent(|| {
        env::set_var("AUTO_TEST_POLL_INTERVAL_MS", "250");
        env::set_var("AUTO_TEST_MAX_TURNS", "20");
        env::set_var("AUTO_TEST_MAX_POLL_FAILURES", "2");
        env::set_var("REPAIR_MAX_ITERATIONS", "4");

        let config = Config::from_env().unwrap();
        assert_eq!(config.polling.auto_test_interval_ms, 250);
        assert_eq!(config.polling.max_auto_test_turns, 20);
        assert_eq!(config.polling.max_poll_failures, 2);
        assert_eq!(config.repair.max_iterations, 4);

        env::remove_var("AUTO_TEST_POLL_INTERVAL_MS");
        env::remove_var("AUTO_TEST_MAX_TURNS");
        env::remove_var("AUTO_TEST_MAX_POLL_FAILURES");
        env::remove_var("REPAIR_MAX_ITERATIONS");
    });
}

#[test]
#[serial]
fn test_config_zero_poll_interval_uses_default() {
    with_agent(|| {
        env::set_var("AUTO_TEST_POLL_INTERVAL_MS", "0");

        let config = Config::from_env().unwrap();
        assert_eq!(config.polling.auto_test_interval_ms, 1000);

        env::remove_var("AUTO_TEST_POLL_INTERVAL_MS");
    });
}

#[test]
#[serial]
fn test_config_invalid_number_uses_default() {
    with_agent(|| {
        env::set_var("DATABASE_MAX_CONNECTIONS", "not-a-number");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database.max_connections, 5);

        env::remove_var("DATABASE_MAX_CONNECTIONS");
    });
}

#[test]
#[serial]
fn test_config_graph_path() {
    with_agent(|| {
        env::set_var("AGENT_GRAPH_PATH", "/tmp/agent.json");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.graph.path.as_deref().and_then(|p| p.to_str()),
            Some("/tmp/agent.json")
        );

        env::remove_var("AGENT_GRAPH_PATH");
    });
}
