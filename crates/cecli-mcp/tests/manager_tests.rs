//! Connection manager integration tests.
//!
//! Drives real subprocesses: small `sh` scripts that speak just enough MCP
//! to complete the handshake and answer `tools/list`.

#![cfg(unix)]

use cecli_auth::TokenStore;
use cecli_mcp::{ConnectionSettings, McpServerManager, McpTool, ServerConfig, ServerHandle};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.0.1"}}}"#;

/// A server that completes the handshake and lists `tools_reply` as id 2.
fn mock_server(name: &str, tools_reply: &str) -> ServerConfig {
    let script = format!(
        "[ -n \"$SPAWN_LOG\" ] && echo spawned >> \"$SPAWN_LOG\"\n\
         read init\n\
         echo '{INIT_REPLY}'\n\
         read initialized\n\
         read list\n\
         echo '{tools_reply}'\n\
         sleep 30"
    );
    ServerConfig::stdio(name, "sh", ["-c".to_string(), script])
}

fn listing(tool: &str) -> String {
    format!(r#"{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"{tool}","description":"d","inputSchema":{{"type":"object"}}}}]}}}}"#)
}

fn settings(dir: &TempDir) -> Arc<ConnectionSettings> {
    Arc::new(
        ConnectionSettings::new(TokenStore::new(dir.path().join("tokens.json")))
            .with_stderr_log(dir.path().join("logs/mcp-errors.log")),
    )
}

/// One healthy and one unreachable server: one connects, one is reported.
#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let manager = McpServerManager::from_configs(
        vec![
            mock_server("good", &listing("read_file")),
            ServerConfig::stdio("bad", "/definitely/not/a/command", Vec::<String>::new()),
        ],
        settings(&temp),
    );

    let outcome = manager.connect_all().await;
    assert_eq!(outcome.succeeded, vec!["good".to_string()]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "bad");

    let tools = manager.get_server_tools("good").await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].to_function_schema()["function"]["name"], "read_file");

    let connected: Vec<_> = manager
        .connected_servers()
        .await
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    assert_eq!(connected, vec!["good"]);

    manager.disconnect_all().await;
    assert!(!manager.is_connected().await);
}

/// A failed tool listing leaves the server neither connected nor cached.
#[tokio::test]
async fn test_listing_failure_disconnects() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let error_reply =
        r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32603,"message":"listing exploded"}}"#;
    let manager =
        McpServerManager::from_configs(vec![mock_server("flaky", error_reply)], settings(&temp));

    let outcome = manager.connect_all().await;
    assert!(outcome.succeeded.is_empty());
    assert!(outcome.failed[0].1.contains("listing exploded"));

    assert!(!manager.is_connected().await);
    assert!(manager.all_tools().await.is_empty());

    let handle = manager.get_server("flaky").await.expect("handle exists");
    assert!(!handle.is_connected().await);
}

/// Concurrent connects on one handle spawn a single process.
#[tokio::test]
async fn test_concurrent_connects_spawn_once() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let spawn_log = temp.path().join("spawns");
    let config = mock_server("once", &listing("t"))
        .with_env("SPAWN_LOG", spawn_log.to_string_lossy().to_string());
    let handle = ServerHandle::new(config, settings(&temp));

    let (first, second) = tokio::join!(handle.connect(), handle.connect());
    let first = first.expect("first connect").expect("enabled");
    let second = second.expect("second connect").expect("enabled");
    assert!(Arc::ptr_eq(&first, &second));

    let spawns = std::fs::read_to_string(&spawn_log).expect("Failed to read spawn log");
    assert_eq!(spawns.lines().count(), 1);

    handle.disconnect().await;
}

/// A server can be reconnected after a disconnect.
#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let manager =
        McpServerManager::from_configs(vec![mock_server("s", &listing("t"))], settings(&temp));

    assert!(manager.connect_server("s").await);
    assert!(manager.disconnect_server("s").await);
    assert!(manager.get_server_tools("s").await.is_empty());

    assert!(manager.connect_server("s").await);
    assert_eq!(manager.get_server_tools("s").await.len(), 1);
    manager.disconnect_all().await;
}

/// The local server hands out one sentinel session until disconnected.
#[tokio::test]
async fn test_local_server_sentinel() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let tool = McpTool::new("edit", "Edit a file", json!({"type": "object"}));
    let manager = McpServerManager::new(vec![ServerHandle::local(
        "Local",
        vec![tool],
        settings(&temp),
    )]);

    manager.connect_all().await;
    let handle = manager.get_server("Local").await.expect("handle exists");
    let first = handle.session().await.expect("connected");
    let again = handle.connect().await.expect("connect").expect("enabled");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(manager.get_server_tools("Local").await[0].name, "edit");

    manager.disconnect_all().await;
    assert!(handle.session().await.is_none());
}

/// Disconnecting with nothing connected is a no-op.
#[tokio::test]
async fn test_disconnect_all_when_idle() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let manager =
        McpServerManager::from_configs(vec![mock_server("idle", &listing("t"))], settings(&temp));

    let outcome = manager.disconnect_all().await;
    assert!(outcome.succeeded.is_empty());
    assert!(outcome.failed.is_empty());
    assert_eq!(manager.failed_servers().await.len(), 1);
}

/// Child stderr lands in the configured log.
#[tokio::test]
async fn test_stderr_is_logged() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let config = ServerConfig::stdio("noisy", "sh", ["-c", "echo boom >&2; exit 1"]);
    let manager = McpServerManager::from_configs(vec![config], settings(&temp));

    let outcome = manager.connect_all().await;
    assert_eq!(outcome.failed.len(), 1);

    let log = std::fs::read_to_string(temp.path().join("logs/mcp-errors.log"))
        .expect("Failed to read stderr log");
    assert!(log.contains("boom"));
}
