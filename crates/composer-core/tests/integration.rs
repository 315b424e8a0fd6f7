//! Integration tests for the composer.
//!
//! These tests drive real child processes (the `mock-mcp-server` binary built
//! from `tests/mock_server.rs`) through supervision, the merged namespace and
//! both translator directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use composer_core::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
use composer_core::{
    Composer, ComposerError, ComposerEvent, ConflictStrategy, EventSink, HealthSettings,
    InvokeError, LifecycleState, MemoryObserver, ProbeStrategy, RegistryPolicy, RemoteTransport,
    RestartPolicy, RestartSettings, ServerSpec, StdioToStreamConfig, StdioTransport,
    StreamToStdioConfig, StreamingConfig, StreamingTransport, TranslatorConfig, Transport,
};
use composer_core::transport::Envelope;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Path of the mock server binary, when cargo built it for this test run.
fn mock_server_path() -> Option<&'static str> {
    option_env!("CARGO_BIN_EXE_mock-mcp-server")
}

macro_rules! require_mock {
    () => {
        match mock_server_path() {
            Some(path) => path,
            None => {
                eprintln!("Skipping test: mock-mcp-server not built");
                return;
            }
        }
    };
}

fn mock(name: &str, path: &str, args: &[&str]) -> ServerSpec {
    ServerSpec::new(name, path)
        .with_args(["--name", name])
        .with_args(args.iter().copied())
        .with_health(HealthSettings::disabled())
}

fn local_streaming() -> StreamingConfig {
    StreamingConfig::default().with_bind(SocketAddr::from(([127, 0, 0, 1], 0)))
}

fn text_of(result: &Value) -> Option<&str> {
    result["content"][0]["text"].as_str()
}

/// Poll `check` every 25ms until it holds or `timeout` passes.
async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Send one request over `transport` and wait for the matching response.
async fn round_trip(transport: &RemoteTransport, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    let mut inbound = transport.subscribe(CancellationToken::new()).unwrap();
    transport.send(Envelope::new(request)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let envelope = inbound.next().await.expect("feed ended");
            if let JsonRpcMessage::Response(response) = envelope.message {
                if response.id.as_ref() == Some(&id) {
                    return response;
                }
            }
        }
    })
    .await
    .expect("no response")
}

/// Next JSON line from `lines`, within 10 seconds.
async fn next_json<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .expect("no message")
        .unwrap()
        .expect("stream ended");
    serde_json::from_str(&line).unwrap()
}

/// Next JSON line that carries an id, skipping notifications.
async fn next_response<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Value {
    loop {
        let message = next_json(lines).await;
        if message.get("id").is_some() {
            return message;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Namespace and conflicts
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_prefix_strategy_exposes_both_origins() {
    let path = require_mock!();
    let composer = Composer::builder()
        .policy(RegistryPolicy::new(ConflictStrategy::Prefix))
        .server(mock("alpha", path, &["--tools", "echo,lookup"]))
        .server(mock("beta", path, &["--tools", "echo"]))
        .build()
        .unwrap();

    assert!(composer.start_all().await.unwrap().is_empty());

    let mut names: Vec<String> = composer.list_tools().into_iter().map(|t| t.exposed_name).collect();
    names.sort();
    assert_eq!(names, vec!["alpha_echo", "beta_echo", "lookup"]);

    let result = composer
        .invoke("beta_echo", Some(json!({"message": "hello"})))
        .await
        .unwrap();
    assert_eq!(text_of(&result), Some("hello"));

    let result = composer.invoke("lookup", None).await.unwrap();
    assert_eq!(text_of(&result), Some("alpha:lookup"));

    let conflicts = composer.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].origin_name, "echo");

    composer.shutdown().await;
}

#[tokio::test]
async fn test_override_strategy_routes_to_latest() {
    let path = require_mock!();
    let composer = Composer::builder()
        .policy(RegistryPolicy::new(ConflictStrategy::Override))
        .server(mock("alpha", path, &["--tools", "echo"]))
        .server(mock("beta", path, &["--tools", "echo"]))
        .build()
        .unwrap();
    composer.start_all().await.unwrap();

    let tool = composer.get_tool("echo").unwrap();
    assert_eq!(tool.origin_server, "beta");
    assert_eq!(composer.list_tools().len(), 1);

    composer.shutdown().await;
}

#[tokio::test]
async fn test_error_strategy_refuses_second_server() {
    let path = require_mock!();
    let composer = Composer::builder()
        .policy(RegistryPolicy::new(ConflictStrategy::Error))
        .server(mock("alpha", path, &["--tools", "echo"]))
        .server(mock("beta", path, &["--tools", "echo"]))
        .build()
        .unwrap();

    composer.start("alpha").await.unwrap();
    let err = composer.start("beta").await.unwrap_err();
    assert!(matches!(err, ComposerError::ToolConflict { .. }));

    // The server stays up; the namespace keeps the first owner.
    assert_eq!(composer.status("beta").unwrap().state, LifecycleState::Running);
    assert_eq!(composer.get_tool("echo").unwrap().origin_server, "alpha");
    assert!(!composer.conflicts().is_empty());

    composer.shutdown().await;
}

#[tokio::test]
async fn test_alias_routes_to_target() {
    let path = require_mock!();
    let composer = Composer::builder()
        .policy(RegistryPolicy::new(ConflictStrategy::Prefix).with_alias("sum", "add"))
        .server(mock("alpha", path, &[]))
        .build()
        .unwrap();
    composer.start_all().await.unwrap();

    let result = composer.invoke("sum", Some(json!({"a": 2, "b": 3}))).await.unwrap();
    assert_eq!(text_of(&result), Some("5"));

    composer.shutdown().await;
}

#[tokio::test]
async fn test_prompts_and_resources_are_merged() {
    let path = require_mock!();
    let composer = Composer::builder()
        .server(mock(
            "alpha",
            path,
            &["--prompts", "greet", "--resources", "file:///notes.txt"],
        ))
        .build()
        .unwrap();
    composer.start_all().await.unwrap();

    assert_eq!(composer.list_prompts().len(), 1);
    assert_eq!(composer.list_resources().len(), 1);

    let prompt = composer.get_prompt("greet", None).await.unwrap();
    assert_eq!(prompt["messages"][0]["content"]["text"], "alpha:greet");

    let resource = composer.read_resource("file:///notes.txt").await.unwrap();
    assert_eq!(resource["contents"][0]["text"], "alpha:file:///notes.txt");

    composer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Invocation errors
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_invoke_errors_are_classified() {
    let path = require_mock!();
    let composer = Composer::builder().server(mock("alpha", path, &[])).build().unwrap();
    composer.start_all().await.unwrap();

    let err = composer.invoke("missing", None).await.unwrap_err();
    assert!(matches!(err, InvokeError::NotFound(_)));

    match composer.invoke("fail", None).await.unwrap_err() {
        InvokeError::Downstream(error) => assert_eq!(error.code, -32000),
        other => panic!("expected a downstream error, got {other:?}"),
    }

    composer.stop("alpha").await.unwrap();
    match composer.invoke("echo", None).await.unwrap_err() {
        InvokeError::Unavailable { server, state, .. } => {
            assert_eq!(server, "alpha");
            assert_eq!(state, LifecycleState::Stopped);
        }
        other => panic!("expected unavailable, got {other:?}"),
    }

    composer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervision
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_bound_is_honoured() {
    let path = require_mock!();
    let restart = RestartSettings::new(RestartPolicy::Always, 2)
        .with_delay(Duration::from_millis(50), Duration::from_millis(100));
    let spec = mock("flaky", path, &["--exit-after-ms", "300", "--exit-code", "1"]).with_restart(restart);
    let observer = Arc::new(MemoryObserver::new(512));
    let composer = Composer::builder()
        .observer(observer.clone())
        .server(spec)
        .build()
        .unwrap();

    composer.start("flaky").await.unwrap();

    let settled = eventually(Duration::from_secs(10), || {
        let status = composer.status("flaky").unwrap();
        status.state == LifecycleState::Crashed && status.restart_count == 2
    })
    .await;
    assert!(settled, "server never settled: {:?}", composer.status("flaky"));

    // No third restart.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = composer.status("flaky").unwrap();
    assert_eq!(status.state, LifecycleState::Crashed);
    assert_eq!(status.restart_count, 2);
    assert_eq!(status.exit_code, Some(1));

    let fatal = eventually(Duration::from_secs(2), || {
        observer
            .snapshot()
            .iter()
            .any(|e| matches!(e, ComposerEvent::Fatal { server, .. } if server == "flaky"))
    })
    .await;
    assert!(fatal);

    let err = composer.restart("flaky").await.unwrap_err();
    assert!(matches!(err, ComposerError::RestartLimitExceeded { .. }));

    composer.shutdown().await;
}

#[tokio::test]
async fn test_hung_health_probe_crashes_server() {
    let path = require_mock!();
    let health = HealthSettings {
        enabled: true,
        interval_ms: 100,
        timeout_ms: 100,
        failure_threshold: 2,
        probe: ProbeStrategy::Ping,
    };
    let spec = ServerSpec::new("hung", path)
        .with_args(["--hang-ping"])
        .with_health(health)
        .with_restart(RestartSettings::new(RestartPolicy::Never, 0));
    let observer = Arc::new(MemoryObserver::new(256));
    let composer = Composer::builder()
        .observer(observer.clone())
        .server(spec)
        .build()
        .unwrap();

    composer.start("hung").await.unwrap();
    let crashed = eventually(Duration::from_secs(5), || {
        matches!(composer.status("hung").map(|s| s.state), Ok(LifecycleState::Crashed))
    })
    .await;
    assert!(crashed);
    assert!(
        observer
            .snapshot()
            .iter()
            .any(|e| matches!(e, ComposerEvent::HealthCheckFailed { .. }))
    );

    composer.shutdown().await;
}

#[tokio::test]
async fn test_stderr_and_malformed_output_become_events() {
    let path = require_mock!();
    let observer = Arc::new(MemoryObserver::new(256));
    let composer = Composer::builder()
        .observer(observer.clone())
        .server(mock("noisy", path, &["--stderr", "booting up", "--malformed"]))
        .build()
        .unwrap();

    composer.start("noisy").await.unwrap();
    assert_eq!(composer.status("noisy").unwrap().state, LifecycleState::Running);

    let seen = eventually(Duration::from_secs(3), || {
        let events = observer.snapshot();
        let diagnostic = events.iter().any(
            |e| matches!(e, ComposerEvent::Diagnostic { line, .. } if line.contains("booting up")),
        );
        let malformed = events
            .iter()
            .any(|e| matches!(e, ComposerEvent::TranslationError { .. }));
        diagnostic && malformed
    })
    .await;
    assert!(seen);

    composer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Translators
// ─────────────────────────────────────────────────────────────────────────────

fn stream_to_stdio(name: &str, path: &str, timeout_ms: Option<u64>) -> TranslatorConfig {
    TranslatorConfig::StreamToStdio(StreamToStdioConfig {
        name: name.to_string(),
        command: path.to_string(),
        args: vec!["--name".to_string(), name.to_string()],
        env: Default::default(),
        cwd: None,
        streaming: local_streaming(),
        request_timeout_ms: timeout_ms,
    })
}

async fn connect_client(endpoint: &str) -> RemoteTransport {
    let client = RemoteTransport::new("test-client", endpoint, EventSink::detached()).unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_translator_preserves_request_ids() {
    let path = require_mock!();
    let composer = Composer::builder().build().unwrap();
    let id = composer
        .create_translator(stream_to_stdio("bridge", path, None))
        .await
        .unwrap();
    let info = composer.translators().info(id).unwrap();
    assert_eq!(info.state, LifecycleState::Running);
    let endpoint = info.endpoint.expect("endpoint");

    let client = connect_client(&endpoint).await;
    let request = JsonRpcRequest::new(
        "abc-1",
        "tools/call",
        Some(json!({"name": "echo", "arguments": {"message": "through the bridge"}})),
    );
    let response = round_trip(&client, request).await;
    assert_eq!(response.id, Some(RequestId::String("abc-1".to_string())));
    assert_eq!(text_of(response.result.as_ref().unwrap()), Some("through the bridge"));

    // Numeric ids survive too.
    let response = round_trip(&client, JsonRpcRequest::new(7_i64, "ping", None)).await;
    assert_eq!(response.id, Some(RequestId::Number(7)));

    client.disconnect().await.unwrap();
    composer.shutdown().await;
}

#[tokio::test]
async fn test_translator_timeout_clears_pending() {
    let path = require_mock!();
    let composer = Composer::builder().build().unwrap();
    let id = composer
        .create_translator(stream_to_stdio("slow-bridge", path, Some(200)))
        .await
        .unwrap();
    let endpoint = composer.translators().info(id).unwrap().endpoint.unwrap();
    let client = connect_client(&endpoint).await;

    let request = JsonRpcRequest::new(
        "slow-1",
        "tools/call",
        Some(json!({"name": "slow", "arguments": {"delay_ms": 2000}})),
    );
    let response = round_trip(&client, request).await;
    assert_eq!(response.error.unwrap().code, JsonRpcError::REQUEST_TIMEOUT);
    assert_eq!(composer.translators().info(id).unwrap().pending, 0);

    client.disconnect().await.unwrap();
    composer.shutdown().await;
}

#[tokio::test]
async fn test_delete_translator_releases_it() {
    let path = require_mock!();
    let composer = Composer::builder().build().unwrap();
    let id = composer
        .create_translator(stream_to_stdio("temporary", path, None))
        .await
        .unwrap();
    assert_eq!(composer.list_translators().len(), 1);

    composer.delete_translator(id).await.unwrap();
    assert!(composer.list_translators().is_empty());
    assert!(matches!(
        composer.translators().info(id),
        Err(ComposerError::TranslatorNotFound(_))
    ));
    assert!(composer.delete_translator(id).await.is_err());

    composer.shutdown().await;
}

#[tokio::test]
async fn test_translators_chain_end_to_end() {
    let path = require_mock!();
    let composer = Composer::builder().build().unwrap();
    let served = composer
        .create_translator(stream_to_stdio("served", path, None))
        .await
        .unwrap();
    let endpoint = composer.translators().info(served).unwrap().endpoint.unwrap();

    let (caller, translator_side) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(translator_side);
    let relay = composer
        .translators()
        .create_with_pipes(
            StdioToStreamConfig {
                name: "relay".to_string(),
                url: endpoint,
                headers: Default::default(),
                request_timeout_ms: None,
                connect_timeout_ms: None,
            },
            reader,
            writer,
        )
        .await
        .unwrap();

    let (caller_read, mut caller_write) = tokio::io::split(caller);
    let request = json!({
        "jsonrpc": "2.0",
        "id": "chain-1",
        "method": "tools/call",
        "params": {"name": "add", "arguments": {"a": 20, "b": 22}}
    });
    caller_write
        .write_all(format!("{}\n", request).as_bytes())
        .await
        .unwrap();

    let mut lines = BufReader::new(caller_read).lines();
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], "chain-1");
    assert_eq!(response["result"]["content"][0]["text"], "42");

    // Closing the caller's input stops the relay cleanly.
    drop(caller_write);
    let outcome = tokio::time::timeout(Duration::from_secs(5), composer.translators().wait_finished(relay))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, LifecycleState::Stopped);

    composer.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Serving the aggregate
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_serve_aggregate_over_streaming() {
    let path = require_mock!();
    let composer = Composer::builder()
        .server(mock("alpha", path, &["--tools", "echo,add"]))
        .build()
        .unwrap();
    composer.start_all().await.unwrap();

    let endpoint = Arc::new(StreamingTransport::new(
        "aggregate",
        local_streaming(),
        EventSink::detached(),
    ));
    let transport: Arc<dyn Transport> = endpoint.clone();
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let composer = Arc::clone(&composer);
        let cancel = cancel.clone();
        async move { composer.serve(transport, cancel).await }
    });

    assert!(eventually(Duration::from_secs(5), || endpoint.sse_url().is_some()).await);
    let client = connect_client(&endpoint.sse_url().unwrap()).await;

    let response = round_trip(&client, JsonRpcRequest::new(1_i64, "initialize", Some(json!({})))).await;
    assert_eq!(response.result.unwrap()["serverInfo"]["name"], "mcp-composer");

    let response = round_trip(&client, JsonRpcRequest::new(2_i64, "tools/list", None)).await;
    let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
    assert_eq!(tools, 2);

    let response = round_trip(
        &client,
        JsonRpcRequest::new(3_i64, "tools/call", Some(json!({"name": "add", "arguments": {"a": 1, "b": 2}}))),
    )
    .await;
    assert_eq!(text_of(response.result.as_ref().unwrap()), Some("3"));

    let response = round_trip(&client, JsonRpcRequest::new(4_i64, "tools/call", Some(json!({"name": "nope"})))).await;
    assert_eq!(response.error.unwrap().code, JsonRpcError::INVALID_PARAMS);

    client.disconnect().await.unwrap();
    cancel.cancel();
    server.await.unwrap().unwrap();
    composer.shutdown().await;
}

#[tokio::test]
async fn test_serve_over_stdio_answers_while_a_call_is_in_flight() {
    let path = require_mock!();
    let composer = Composer::builder()
        .server(mock("alpha", path, &["--tools", "echo,add,slow"]))
        .build()
        .unwrap();
    composer.start_all().await.unwrap();

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(server_side);
    let transport: Arc<dyn Transport> = Arc::new(StdioTransport::from_pipes(
        "aggregate",
        reader,
        writer,
        EventSink::detached(),
    ));
    let cancel = CancellationToken::new();
    let server = tokio::spawn({
        let composer = Arc::clone(&composer);
        let cancel = cancel.clone();
        async move { composer.serve(transport, cancel).await }
    });

    let (client_read, mut client_write) = tokio::io::split(client_side);
    let mut lines = BufReader::new(client_read).lines();
    for request in [
        json!({
            "jsonrpc": "2.0",
            "id": "slow",
            "method": "tools/call",
            "params": {"name": "slow", "arguments": {"delay_ms": 1500}}
        }),
        json!({"jsonrpc": "2.0", "id": "ping", "method": "ping"}),
    ] {
        client_write
            .write_all(format!("{}\n", request).as_bytes())
            .await
            .unwrap();
    }

    // The ping does not wait behind the slow call.
    let first = next_response(&mut lines).await;
    assert_eq!(first["id"], "ping");
    let second = next_response(&mut lines).await;
    assert_eq!(second["id"], "slow");
    assert_eq!(second["result"]["content"][0]["text"], "Slept for 1500 ms");

    // Namespace changes are announced to the caller.
    composer.add_alias("sum", "add").unwrap();
    let announced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = next_json(&mut lines).await;
            if message["method"] == "notifications/tools/list_changed" {
                return message;
            }
        }
    })
    .await
    .expect("no list_changed notification");
    assert!(announced.get("id").is_none());

    cancel.cancel();
    server.await.unwrap().unwrap();
    composer.shutdown().await;
}
