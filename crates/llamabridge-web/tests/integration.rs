//! Integration tests for web server configuration and construction.

use std::sync::Arc;
use std::time::Duration;

use llamabridge_core::config::ServerConfig;
use llamabridge_core::{BridgeConfig, CompletionAdapter, ScriptedEngine};
use llamabridge_web::{AppState, WebConfig, WebServer};

fn adapter() -> CompletionAdapter {
    let engine = ScriptedEngine::new("local-model", ["hi"]);
    CompletionAdapter::new(Arc::new(engine), Arc::new(BridgeConfig::default())).expect("adapter")
}

#[test]
fn web_config_defaults() {
    let config = WebConfig::default();
    assert_eq!(config.bind_addr, "127.0.0.1");
    assert_eq!(config.port, 8000);
    assert_eq!(config.request_timeout, Some(Duration::from_secs(300)));
    assert!(config.cors);
}

#[test]
fn web_config_from_server_section() {
    let server = ServerConfig {
        bind_addr: "0.0.0.0".into(),
        port: 9090,
        request_timeout_secs: 30,
        cors: false,
    };
    let config = WebConfig::from(&server);
    assert_eq!(config.bind_addr, "0.0.0.0");
    assert_eq!(config.port, 9090);
    assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
    assert!(!config.cors);
}

#[test]
fn zero_timeout_disables_the_limit() {
    let server = ServerConfig {
        request_timeout_secs: 0,
        ..ServerConfig::default()
    };
    assert_eq!(WebConfig::from(&server).request_timeout, None);
}

#[test]
fn server_addr_formats_host_and_port() {
    let config = WebConfig {
        bind_addr: "0.0.0.0".into(),
        port: 3000,
        ..WebConfig::default()
    };
    let server = WebServer::new(config, adapter());
    assert_eq!(server.addr(), "0.0.0.0:3000");
}

#[test]
fn app_state_reports_configured_model() {
    let state = AppState::new(adapter(), WebConfig::default());
    assert_eq!(state.model_id(), "local-model");
    assert!(state.started_at > 0);
}
