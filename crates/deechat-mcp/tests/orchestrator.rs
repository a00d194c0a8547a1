//! End-to-end runtime tests over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deechat_mcp::{
    ErrorKind, McpEventKind, McpOrchestrator, OrchestratorOptions, RegistryPaths, ServerConfig,
    ToolCallRequest, TransportKind,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;

fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        settle_delay: Duration::from_millis(10),
        retry_step: Duration::from_millis(10),
        default_max_retries: 2,
    }
}

fn orchestrator() -> (McpOrchestrator, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let paths = RegistryPaths::new(dir.path().join("data"), None);
    (McpOrchestrator::with_options(paths, fast_options()), dir)
}

fn inmemory_server(id: &str, channel: &str) -> ServerConfig {
    let mut config =
        ServerConfig::new(format!("server {id}"), TransportKind::InMemory).with_channel(channel);
    config.id = id.to_string();
    config.self_handle = true;
    config
}

fn messages_sent(orchestrator: &McpOrchestrator, id: &str) -> u64 {
    orchestrator
        .supervisor()
        .get(id)
        .expect("live client")
        .stats()
        .expect("remote client has transport stats")
        .messages_sent
}

#[tokio::test]
#[serial]
async fn happy_path_discovers_and_calls_the_test_tool() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-happy"))
        .await
        .unwrap();

    let tools = orchestrator.discover_server_tools("s1").await.unwrap();
    assert!(tools.iter().any(|t| t.name == "test-tool"));

    let response = orchestrator
        .call_tool(ToolCallRequest {
            server_id: "s1".into(),
            tool_name: "test-tool".into(),
            arguments: json!({"input": "hi"}),
            call_id: None,
        })
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.result.unwrap()["toolResult"], "Processed: hi");

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn identical_calls_within_ttl_skip_the_wire() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-cache"))
        .await
        .unwrap();

    let request = ToolCallRequest {
        server_id: "s1".into(),
        tool_name: "test-tool".into(),
        arguments: json!({"input": "cached"}),
        call_id: Some("first".into()),
    };

    let first = orchestrator.call_tool(request.clone()).await;
    assert!(first.success);
    assert_eq!(first.call_id.as_deref(), Some("first"));

    let sent_before = messages_sent(&orchestrator, "s1");
    let second = orchestrator
        .call_tool(ToolCallRequest {
            call_id: Some("second".into()),
            ..request
        })
        .await;
    let sent_after = messages_sent(&orchestrator, "s1");

    assert!(second.success);
    assert_eq!(second.call_id.as_deref(), Some("second"));
    assert_eq!(
        second.result, first.result,
        "cached response is structurally equal"
    );
    assert_eq!(sent_before, sent_after, "no wire round-trip on a cache hit");

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn distinct_arguments_miss_the_call_cache() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-miss"))
        .await
        .unwrap();

    let a = orchestrator
        .call_tool(ToolCallRequest {
            server_id: "s1".into(),
            tool_name: "test-tool".into(),
            arguments: json!({"input": "a"}),
            call_id: None,
        })
        .await;
    let b = orchestrator
        .call_tool(ToolCallRequest {
            server_id: "s1".into(),
            tool_name: "test-tool".into(),
            arguments: json!({"input": "b"}),
            call_id: None,
        })
        .await;

    assert_eq!(a.result.unwrap()["toolResult"], "Processed: a");
    assert_eq!(b.result.unwrap()["toolResult"], "Processed: b");

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn failed_calls_return_success_false_and_are_not_cached() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-fail"))
        .await
        .unwrap();

    let tool_errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&tool_errors);
    orchestrator.subscribe(Arc::new(move |event| {
        if event.kind == McpEventKind::ToolError {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    for _ in 0..2 {
        let response = orchestrator
            .call_tool(ToolCallRequest {
                server_id: "s1".into(),
                tool_name: "no-such-tool".into(),
                arguments: json!({}),
                call_id: None,
            })
            .await;
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("no-such-tool"));
    }

    // Both invocations hit the server: failures are never cached.
    assert_eq!(tool_errors.load(Ordering::SeqCst), 2);

    let unknown = orchestrator
        .call_tool(ToolCallRequest {
            server_id: "ghost".into(),
            tool_name: "x".into(),
            arguments: json!({}),
            call_id: None,
        })
        .await;
    assert!(!unknown.success);
    assert!(unknown.error.unwrap().contains("unknown server"));

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn enabling_an_unreachable_server_rolls_back() {
    let (orchestrator, dir) = orchestrator();
    orchestrator.initialize().await.unwrap();

    let mut config = ServerConfig::new("broken", TransportKind::Stdio)
        .with_command("definitely-not-a-real-binary-4242")
        .with_enabled(false);
    config.id = "broken".into();
    config.retry.max_retries = 1;
    let added = orchestrator.add_server(config).await.unwrap();
    assert!(!added.is_enabled);

    let err = orchestrator
        .update_server("broken", json!({"isEnabled": true}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);

    // The in-memory index rolled back.
    let current = orchestrator.registry().get("broken").unwrap();
    assert!(!current.is_enabled);

    // And the on-disk file agrees.
    let path = dir
        .path()
        .join("data")
        .join("mcp")
        .join("servers")
        .join("broken.json");
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(on_disk["isEnabled"], json!(false));

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn disabling_a_server_closes_it_and_drops_its_cache() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-disable"))
        .await
        .unwrap();
    orchestrator.discover_server_tools("s1").await.unwrap();
    assert!(!orchestrator.get_all_tools().await.is_empty());

    orchestrator
        .update_server("s1", json!({"isEnabled": false}))
        .await
        .unwrap();

    assert!(orchestrator.supervisor().get("s1").is_none());
    let status = orchestrator.get_server_status("s1").await.unwrap();
    assert_eq!(status.tool_count, 0);

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn get_all_tools_aggregates_across_servers() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-agg-1"))
        .await
        .unwrap();
    orchestrator
        .add_server(inmemory_server("s2", "e2e-agg-2"))
        .await
        .unwrap();

    let tools = orchestrator.get_all_tools().await;
    let mut owners: Vec<&str> = tools.iter().map(|t| t.server_id.as_str()).collect();
    owners.sort_unstable();
    owners.dedup();
    assert_eq!(owners, vec!["s1", "s2"]);

    let hits = orchestrator.search_tools("test-tool").await;
    assert_eq!(hits.len(), 2);
    assert!(orchestrator.search_tools("zebra").await.is_empty());

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn usage_counters_grow_with_successful_calls() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-usage"))
        .await
        .unwrap();

    for input in ["one", "two"] {
        let response = orchestrator
            .call_tool(ToolCallRequest {
                server_id: "s1".into(),
                tool_name: "test-tool".into(),
                arguments: json!({ "input": input }),
                call_id: None,
            })
            .await;
        assert!(response.success);
    }

    let tools = orchestrator.get_all_tools().await;
    let tool = tools.iter().find(|t| t.name == "test-tool").unwrap();
    assert_eq!(tool.usage_count, 2);
    assert!(tool.last_used_at.is_some());

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn remove_server_forgets_everything() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-remove"))
        .await
        .unwrap();
    orchestrator.discover_server_tools("s1").await.unwrap();

    orchestrator.remove_server("s1").await.unwrap();
    assert!(orchestrator.registry().get("s1").is_none());
    assert!(orchestrator.get_all_servers().is_empty());
    assert!(orchestrator.supervisor().get("s1").is_none());

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn connection_test_uses_an_ephemeral_client() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();

    let config = inmemory_server("s1", "e2e-test-conn").with_enabled(false);
    orchestrator.add_server(config).await.unwrap();

    assert!(orchestrator.test_server_connection("s1").await);
    // The probe never installed a supervised client.
    assert!(orchestrator.supervisor().get("s1").is_none());

    assert!(!orchestrator.test_server_connection("missing").await);

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn startup_connects_enabled_servers_and_tolerates_failures() {
    let dir = TempDir::new().unwrap();
    let paths = RegistryPaths::new(dir.path().join("data"), None);

    // Seed the registry through a first runtime.
    {
        let seeder = McpOrchestrator::with_options(paths.clone(), fast_options());
        seeder.initialize().await.unwrap();
        seeder
            .add_server(inmemory_server("good", "e2e-startup"))
            .await
            .unwrap();
        let mut broken = ServerConfig::new("broken", TransportKind::Stdio)
            .with_command("definitely-not-a-real-binary-4242");
        broken.id = "broken".into();
        broken.retry.max_retries = 1;
        // add_server tries to connect; the failure is logged, not fatal.
        seeder.add_server(broken).await.unwrap();
        seeder.destroy().await;
    }

    let orchestrator = McpOrchestrator::with_options(paths, fast_options());
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    orchestrator.subscribe(Arc::new(move |event| {
        if event.kind == McpEventKind::ServerError {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    // Startup succeeds even though one server cannot spawn.
    orchestrator.initialize().await.unwrap();
    assert!(errors.load(Ordering::SeqCst) >= 1);
    assert!(orchestrator.supervisor().get("good").is_some());
    assert!(orchestrator.supervisor().get("broken").is_none());

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn lifecycle_events_flow_through_the_bus() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    orchestrator.subscribe(Arc::new(move |event| {
        sink.lock().push(event.kind);
    }));

    orchestrator
        .add_server(inmemory_server("s1", "e2e-events"))
        .await
        .unwrap();
    orchestrator
        .call_tool(ToolCallRequest {
            server_id: "s1".into(),
            tool_name: "test-tool".into(),
            arguments: json!({"input": "x"}),
            call_id: None,
        })
        .await;
    orchestrator.remove_server("s1").await.unwrap();

    let kinds = seen.lock().clone();
    assert!(kinds.contains(&McpEventKind::ConfigAdded));
    assert!(kinds.contains(&McpEventKind::ServerConnected));
    assert!(kinds.contains(&McpEventKind::ToolDiscovered));
    assert!(kinds.contains(&McpEventKind::ToolCalled));
    assert!(kinds.contains(&McpEventKind::ConfigRemoved));
    assert!(kinds.contains(&McpEventKind::ServerDisconnected));

    // Per-server ordering: connected before tools discovered.
    let connected_at = kinds
        .iter()
        .position(|k| *k == McpEventKind::ServerConnected)
        .unwrap();
    let discovered_at = kinds
        .iter()
        .position(|k| *k == McpEventKind::ToolDiscovered)
        .unwrap();
    assert!(connected_at < discovered_at);

    orchestrator.destroy().await;
}

#[tokio::test]
#[serial]
async fn export_import_round_trip_counts_configs() {
    let (orchestrator, _dir) = orchestrator();
    orchestrator.initialize().await.unwrap();
    orchestrator
        .add_server(inmemory_server("s1", "e2e-export").with_enabled(false))
        .await
        .unwrap();

    let exported = orchestrator.export_configs().unwrap();

    let (other, _dir2) = self::orchestrator();
    other.initialize().await.unwrap();
    let imported = other.import_configs(&exported).await.unwrap();
    assert_eq!(imported, 1);
    assert_eq!(other.get_all_servers().len(), 1);

    orchestrator.destroy().await;
    other.destroy().await;
}
