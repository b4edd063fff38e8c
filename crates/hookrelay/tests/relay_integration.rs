//! Integration tests for hookrelay
//!
//! Each test runs a scripted SSE source and a recording target in-process
//! and drives a real session between them.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::LOCATION;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use hookrelay::testing::{
    wait_for, CaptureTarget, RecordingLogger, ScriptedResponse, SseScript, TestServer,
};
use hookrelay::{
    create_channel, Backoff, ChannelError, PayloadMode, RelayConfig, RelayError, RelayHandle,
    RelaySession, SessionState,
};
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Helpers
// =============================================================================

async fn serve(router: Router) -> TestServer {
    TestServer::start(router).await.unwrap()
}

fn config(source: &TestServer, target: &str) -> RelayConfig {
    RelayConfig::new(source.url("/events"), target)
        .with_backoff(Duration::from_millis(50), Duration::from_millis(200))
        .with_forward_timeout(Duration::from_secs(2))
}

fn start(config: RelayConfig, logger: &Arc<RecordingLogger>) -> (RelaySession, RelayHandle) {
    let mut session = RelaySession::new(config)
        .unwrap()
        .with_logger(logger.clone());
    let handle = session.start();
    (session, handle)
}

async fn wait_for_state(handle: &RelayHandle, state: SessionState) -> bool {
    wait_for(|| handle.state() == state, WAIT).await
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn test_forwards_events_in_order_with_metadata_headers() {
    let script = SseScript::new(ScriptedResponse::hold([
        "event: ping\ndata: hello\n\n",
        "id: 42\ndata: {\"a\":1}\n\n",
    ]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, &sink.url("/hook")), &logger);

    assert!(wait_for(|| target.len() == 2, WAIT).await);
    let requests = target.requests();

    assert_eq!(requests[0].method, axum::http::Method::POST);
    assert_eq!(requests[0].uri.path(), "/hook");
    assert_eq!(requests[0].body_str(), "hello");
    assert_eq!(requests[0].header("x-event-type"), Some("ping"));
    assert_eq!(requests[0].header("x-event-id"), None);

    assert_eq!(requests[1].body_str(), "{\"a\":1}");
    assert_eq!(requests[1].header("x-event-type"), Some("message"));
    assert_eq!(requests[1].header("x-event-id"), Some("42"));
    assert_eq!(requests[1].header("content-type"), Some("application/json"));

    assert_eq!(handle.state(), SessionState::Streaming);
    assert_eq!(handle.retry_count(), 0);
    assert_eq!(
        script.connections()[0].accept.as_deref(),
        Some("text/event-stream")
    );
    assert!(logger.contains("Connected"));

    handle.close().await;
}

#[tokio::test]
async fn test_forwarded_body_equals_multiline_data() {
    let script = SseScript::new(ScriptedResponse::hold(["data: line one\ndata: line two\n\n"]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, &sink.url("/")), &logger);

    assert!(wait_for(|| target.len() == 1, WAIT).await);
    assert_eq!(target.requests()[0].body_str(), "line one\nline two");

    handle.close().await;
}

#[tokio::test]
async fn test_keepalives_are_not_forwarded() {
    let script = SseScript::new(ScriptedResponse::hold([
        ":keepalive\n\n",
        "event: ping\n\n",
        "data: real\n\n",
    ]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, &sink.url("/")), &logger);

    assert!(wait_for(|| target.len() == 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(target.len(), 1);
    assert_eq!(target.requests()[0].body_str(), "real");

    handle.close().await;
}

#[tokio::test]
async fn test_target_error_status_is_not_retried() {
    let script = SseScript::new(ScriptedResponse::hold(["data: x\n\n"]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::with_response(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO);
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, &sink.url("/")), &logger);

    assert!(wait_for(|| target.len() == 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(target.len(), 1);
    assert_eq!(script.attempts(), 1);
    assert_eq!(handle.state(), SessionState::Streaming);
    assert_eq!(handle.retry_count(), 0);
    assert!(wait_for(|| logger.contains("500"), WAIT).await);

    handle.close().await;
}

#[tokio::test]
async fn test_unreachable_target_drops_events_and_keeps_streaming() {
    let script = SseScript::new(ScriptedResponse::hold(["data: one\n\n", "data: two\n\n"]));
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, "http://127.0.0.1:1/hook"), &logger);

    let failures = || {
        logger
            .messages()
            .iter()
            .filter(|m| m.starts_with("Failed to forward"))
            .count()
    };
    assert!(wait_for(|| failures() == 2, WAIT).await);
    assert_eq!(handle.state(), SessionState::Streaming);
    assert_eq!(script.attempts(), 1);

    handle.close().await;
}

#[tokio::test]
async fn test_slow_target_times_out_and_event_is_dropped() {
    let script = SseScript::new(ScriptedResponse::hold(["data: slow\n\n", "data: next\n\n"]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::with_response(StatusCode::OK, Duration::from_millis(500));
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let config = config(&source, &sink.url("/")).with_forward_timeout(Duration::from_millis(100));
    let (_session, handle) = start(config, &logger);

    assert!(wait_for(|| target.len() == 2, WAIT).await);
    assert!(wait_for(|| logger.contains("target timed out"), WAIT).await);
    assert_eq!(handle.state(), SessionState::Streaming);

    handle.close().await;
}

#[tokio::test]
async fn test_event_allow_list() {
    let script = SseScript::new(ScriptedResponse::hold([
        "event: push\ndata: wanted\n\n",
        "event: issues\ndata: unwanted\n\n",
        "event: push\ndata: wanted too\n\n",
    ]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let config = config(&source, &sink.url("/")).with_events(["push"]);
    let (_session, handle) = start(config, &logger);

    assert!(wait_for(|| target.len() == 2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let bodies: Vec<String> = target
        .requests()
        .iter()
        .map(|r| r.body_str().to_string())
        .collect();
    assert_eq!(bodies, vec!["wanted", "wanted too"]);

    handle.close().await;
}

#[tokio::test]
async fn test_envelope_mode_rebuilds_webhook() {
    let envelope = r#"{"x-github-event":"push","host":"smee.io","body":{"ref":"main"},"query":{"q":"1"}}"#;
    let script = SseScript::new(ScriptedResponse::hold([
        "event: ready\ndata: {}\n\n".to_string(),
        format!("data: {}\n\n", envelope),
    ]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let config = config(&source, &sink.url("/events")).with_payload(PayloadMode::Envelope);
    let (_session, handle) = start(config, &logger);

    assert!(wait_for(|| target.len() == 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(target.len(), 1);

    let request = &target.requests()[0];
    assert_eq!(request.uri.path(), "/events");
    assert_eq!(request.uri.query(), Some("q=1"));
    assert_eq!(request.header("x-github-event"), Some("push"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert_ne!(request.header("host"), Some("smee.io"));
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body, serde_json::json!({"ref": "main"}));

    handle.close().await;
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_reconnects_after_close_and_resumes_from_last_id() {
    let script = SseScript::new(ScriptedResponse::hold(["data: second\n\n"]))
        .then(ScriptedResponse::events(["id: 7\ndata: first\n\n"]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, &sink.url("/")), &logger);

    assert!(wait_for(|| target.len() == 2, WAIT).await);
    assert!(wait_for_state(&handle, SessionState::Streaming).await);

    let connections = script.connections();
    assert_eq!(connections.len(), 2);
    assert_eq!(connections[0].last_event_id, None);
    assert_eq!(connections[1].last_event_id.as_deref(), Some("7"));
    assert!(connections[1].at.duration_since(connections[0].at) >= Duration::from_millis(45));

    assert_eq!(handle.retry_count(), 0);
    assert!(logger.contains("Disconnected"));
    assert!(logger.contains("stream closed by upstream"));

    handle.close().await;
}

#[tokio::test]
async fn test_backoff_delays_double_up_to_cap() {
    let script = SseScript::new(ScriptedResponse::Status(503));
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();
    let base = Duration::from_millis(40);
    let cap = Duration::from_millis(160);
    let backoff = Backoff::new(base, cap);

    let config = RelayConfig::new(source.url("/events"), "http://127.0.0.1:1/")
        .with_backoff(base, cap);
    let (_session, handle) = start(config, &logger);

    assert!(wait_for(|| script.attempts() >= 5, WAIT).await);
    handle.close().await;

    let connections = script.connections();
    for k in 1..=4u32 {
        let gap = connections[k as usize].at.duration_since(connections[k as usize - 1].at);
        let expected = backoff.delay(k);
        assert!(
            gap + Duration::from_millis(5) >= expected,
            "gap before attempt {} was {:?}, expected at least {:?}",
            k + 1,
            gap,
            expected
        );
    }
    assert!(logger.contains("unexpected status 503"));
}

#[tokio::test]
async fn test_retry_count_matches_failed_attempts() {
    let script = SseScript::new(ScriptedResponse::Status(502));
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();

    let config = RelayConfig::new(source.url("/events"), "http://127.0.0.1:1/")
        .with_backoff(Duration::from_millis(20), Duration::from_millis(400));
    let (_session, handle) = start(config, &logger);

    // Delay before attempt 5 is 160ms, long enough to read both sides
    assert!(
        wait_for(
            || handle.state() == SessionState::Backoff && handle.retry_count() == 4,
            WAIT
        )
        .await
    );
    assert_eq!(script.attempts(), 4);

    handle.close().await;
}

#[tokio::test]
async fn test_wrong_content_type_triggers_backoff() {
    let script = SseScript::new(ScriptedResponse::WrongContentType);
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, "http://127.0.0.1:1/"), &logger);

    assert!(wait_for_state(&handle, SessionState::Backoff).await);
    assert!(logger.contains("unexpected content type 'application/json'"));

    handle.close().await;
}

#[tokio::test]
async fn test_refused_source_keeps_retrying() {
    let logger = RecordingLogger::new();
    let config = RelayConfig::new("http://127.0.0.1:1/events", "http://127.0.0.1:1/")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(20));

    let (_session, handle) = start(config, &logger);

    assert!(wait_for(|| handle.retry_count() >= 3, WAIT).await);
    assert!(logger.contains("connect failed"));

    handle.close().await;
}

#[tokio::test]
async fn test_silent_source_times_out_into_backoff() {
    // Accepts connections and never answers them
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let held = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            sockets.push(socket);
        }
    });
    let logger = RecordingLogger::new();

    let config = RelayConfig::new(format!("http://{}/events", addr), "http://127.0.0.1:1/")
        .with_backoff(Duration::from_millis(50), Duration::from_millis(100))
        .with_connect_timeout(Duration::from_millis(200));
    let (_session, handle) = start(config, &logger);

    assert!(wait_for_state(&handle, SessionState::Backoff).await);
    assert!(handle.retry_count() >= 1);
    assert!(logger.contains("no response within 200 ms"));
    assert!(logger.contains("Reconnecting in"));

    handle.close().await;
    held.abort();
}

// =============================================================================
// Stopping
// =============================================================================

#[tokio::test]
async fn test_stop_during_backoff_prevents_further_attempts() {
    let script = SseScript::new(ScriptedResponse::Status(503));
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();

    let config = RelayConfig::new(source.url("/events"), "http://127.0.0.1:1/")
        .with_backoff(Duration::from_millis(300), Duration::from_millis(300));
    let (mut session, handle) = start(config, &logger);

    assert!(wait_for_state(&handle, SessionState::Backoff).await);
    session.stop().await;
    let attempts = script.attempts();

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(attempts, 1);
    assert_eq!(script.attempts(), attempts);
    assert_eq!(handle.state(), SessionState::Stopped);
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(logger.contains("Stopped forwarding"));
}

#[tokio::test]
async fn test_restart_resumes_from_last_event_id() {
    let script = SseScript::new(ScriptedResponse::hold(Vec::<String>::new()))
        .then(ScriptedResponse::hold(["id: 9\ndata: before stop\n\n"]));
    let source = serve(script.router()).await;
    let target = CaptureTarget::new();
    let sink = serve(target.router()).await;
    let logger = RecordingLogger::new();

    let (mut session, _first) = start(config(&source, &sink.url("/")), &logger);
    assert!(wait_for(|| target.len() == 1, WAIT).await);
    session.stop().await;

    let second = session.start();
    assert!(wait_for(|| script.attempts() == 2, WAIT).await);

    let connections = script.connections();
    assert_eq!(connections[0].last_event_id, None);
    assert_eq!(connections[1].last_event_id.as_deref(), Some("9"));

    second.close().await;
}

#[tokio::test]
async fn test_close_while_streaming_is_prompt() {
    let script = SseScript::new(ScriptedResponse::hold([":ok\n\n"]));
    let source = serve(script.router()).await;
    let logger = RecordingLogger::new();

    let (_session, handle) = start(config(&source, "http://127.0.0.1:1/"), &logger);
    assert!(wait_for_state(&handle, SessionState::Streaming).await);

    tokio::time::timeout(Duration::from_secs(1), handle.close())
        .await
        .expect("close should not wait for the open stream");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.state(), SessionState::Stopped);
    assert_eq!(script.attempts(), 1);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let script = SseScript::new(ScriptedResponse::hold(["data: shared\n\n"]));
    let source = serve(script.router()).await;
    let first_target = CaptureTarget::new();
    let second_target = CaptureTarget::new();
    let first_sink = serve(first_target.router()).await;
    let second_sink = serve(second_target.router()).await;
    let logger = RecordingLogger::new();

    let (_first, first) = start(config(&source, &first_sink.url("/")), &logger);
    let (_second, second) = start(config(&source, &second_sink.url("/")), &logger);

    assert!(wait_for(|| first_target.len() == 1 && second_target.len() == 1, WAIT).await);

    first.close().await;
    assert_eq!(first.state(), SessionState::Stopped);
    assert_eq!(second.state(), SessionState::Streaming);

    second.close().await;
}

// =============================================================================
// Configuration and channels
// =============================================================================

#[test]
fn test_malformed_source_fails_synchronously() {
    let result = RelaySession::new(RelayConfig::new("not a url", "http://localhost:5000/"));
    assert!(matches!(result, Err(RelayError::InvalidUrl { .. })));
}

#[tokio::test]
async fn test_create_channel_follows_location() {
    let router = Router::new().route(
        "/new",
        get(|| async { (StatusCode::TEMPORARY_REDIRECT, [(LOCATION, "/abc123")]) }),
    );
    let host = serve(router).await;

    let channel = create_channel(&host.base_url()).await.unwrap();

    assert_eq!(channel.as_str(), host.url("/abc123"));
}

#[tokio::test]
async fn test_create_channel_without_redirect() {
    let router = Router::new().route("/new", get(|| async { "no channels here" }));
    let host = serve(router).await;

    let err = create_channel(&host.base_url()).await.unwrap_err();

    assert!(matches!(err, ChannelError::NoLocation { status: 200 }));
}
