#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use claude_bridge::config::BridgeConfig;
use claude_bridge::router::{build_router, AppState};

const RESULT_LINE: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"Hi there","usage":{"input_tokens":4,"output_tokens":2}}"#;

const STREAM_LINES: &[&str] = &[
    r#"{"type":"system","subtype":"init","tools":[]}"#,
    r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"msg_cli","usage":{"input_tokens":3}}}}"#,
    r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}}"#,
    r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}}"#,
    r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"there"}}}"#,
    r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#,
    r#"{"type":"stream_event","event":{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}}"#,
    r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hellothere"}]}}"#,
    r#"{"type":"result","subtype":"success","is_error":false,"result":"Hellothere","usage":{"input_tokens":3,"output_tokens":5}}"#,
];

struct TestApp {
    app: Router,
    dir: TempDir,
}

impl TestApp {
    /// Fake CLI that records its argv and stdin, then prints `stdout_lines`.
    fn new(stdout_lines: &[&str], configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mut body = format!(
            "printf '%s\\n' \"$@\" > '{args}'\ncat > '{stdin}'\n",
            args = dir.path().join("args").display(),
            stdin = dir.path().join("stdin").display(),
        );
        for line in stdout_lines {
            body.push_str(&format!("echo '{line}'\n"));
        }
        let cli_path = write_script(dir.path(), &body);

        let mut config = BridgeConfig {
            claude_cli_path: cli_path,
            process_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
            ..BridgeConfig::default()
        };
        configure(&mut config);

        Self {
            app: build_router(AppState::new(config)),
            dir,
        }
    }

    fn with_script(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let cli_path = write_script(dir.path(), body);
        let config = BridgeConfig {
            claude_cli_path: cli_path,
            ..BridgeConfig::default()
        };
        Self {
            app: build_router(AppState::new(config)),
            dir,
        }
    }

    fn captured(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join(name)).ok()
    }
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("claude");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

async fn send_request(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let (status, bytes) = send_request(app, builder.body(body).expect("request")).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

fn basic_request(stream: bool) -> Value {
    json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 256,
        "stream": stream,
        "messages": [{"role": "user", "content": "Say hi"}]
    })
}

/// Splits an SSE body into `(event, data)` pairs.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut frames = Vec::new();
    for block in body.split("\n\n") {
        let mut event = None;
        let mut data = None;
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(payload) = line.strip_prefix("data:") {
                data = Some(serde_json::from_str(payload.trim()).expect("sse data json"));
            }
        }
        if let (Some(event), Some(data)) = (event, data) {
            frames.push((event, data));
        }
    }
    frames
}

#[derive(Serialize)]
struct SnapshotEvent {
    event: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_tokens: Option<u64>,
}

fn normalize_frame(event: &str, data: &Value) -> SnapshotEvent {
    SnapshotEvent {
        event: event.to_string(),
        kind: data["type"].as_str().unwrap_or_default().to_string(),
        index: data["index"].as_u64(),
        text: data["delta"]["text"].as_str().map(str::to_string),
        stop_reason: data["delta"]["stop_reason"].as_str().map(str::to_string),
        output_tokens: data["usage"]["output_tokens"]
            .as_u64()
            .filter(|_| event == "message_delta"),
    }
}

#[tokio::test]
async fn non_streaming_message() {
    let test_app = TestApp::new(&[RESULT_LINE], |_| {});
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(basic_request(false)),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "payload: {payload}");
    assert_eq!(payload["type"], "message");
    assert_eq!(payload["role"], "assistant");
    assert_eq!(payload["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(payload["content"], json!([{"type": "text", "text": "Hi there"}]));
    assert_eq!(payload["stop_reason"], "end_turn");
    assert_eq!(payload["stop_sequence"], Value::Null);
    assert_eq!(payload["usage"], json!({"input_tokens": 4, "output_tokens": 2}));
    let id = payload["id"].as_str().expect("id");
    assert!(id.starts_with("msg_") && id.len() == 28, "id: {id}");

    let args = test_app.captured("args").expect("cli args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.contains(&"--print"));
    assert!(args.windows(2).any(|pair| pair == ["--output-format", "json"]));
    assert!(args.windows(2).any(|pair| pair == ["--model", "sonnet"]));
    assert_eq!(test_app.captured("stdin").as_deref(), Some("Say hi"));
}

#[tokio::test]
async fn system_prompt_and_history_reach_the_cli() {
    let test_app = TestApp::new(&[RESULT_LINE], |_| {});
    let (status, _) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/messages",
        Some(json!({
            "model": "opus",
            "system": [{"type": "text", "text": "Be brief."}],
            "messages": [
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": "Hello!"},
                {"role": "user", "content": "How are you?"}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let args = test_app.captured("args").expect("cli args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args
        .windows(2)
        .any(|pair| pair == ["--append-system-prompt", "Be brief."]));

    let stdin = test_app.captured("stdin").expect("cli stdin");
    assert!(stdin.starts_with("<conversation>\n"), "stdin: {stdin}");
    assert!(stdin.contains("<turn role=\"assistant\">Hello!</turn>"), "stdin: {stdin}");
    assert!(stdin.ends_with("</conversation>\n\nHow are you?"), "stdin: {stdin}");
}

#[tokio::test]
async fn streaming_message_events() {
    let test_app = TestApp::new(STREAM_LINES, |_| {});
    let request = Request::builder()
        .method(Method::POST)
        .uri("/anthropic/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(basic_request(true).to_string()))
        .expect("request");
    let response = test_app.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).and_then(|value| value.to_str().ok()),
        Some("no-cache")
    );

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("sse body")
        .to_bytes();
    let body = String::from_utf8_lossy(&bytes).into_owned();
    assert!(
        body.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"),
        "body: {body}"
    );
    let frames = parse_sse(&body);

    let (first_event, first) = frames.first().expect("message_start");
    assert_eq!(first_event, "message_start");
    assert_eq!(first["message"]["model"], "claude-3-5-sonnet-20241022");
    assert_eq!(first["message"]["content"], json!([]));
    assert!(first["message"]["id"]
        .as_str()
        .is_some_and(|id| id.starts_with("msg_")));

    let events: Vec<SnapshotEvent> = frames
        .iter()
        .map(|(event, data)| normalize_frame(event, data))
        .collect();
    insta::assert_yaml_snapshot!("stream_events", events);

    let args = test_app.captured("args").expect("cli args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.contains(&"--include-partial-messages"));
    assert!(args.windows(2).any(|pair| pair == ["--output-format", "stream-json"]));
}

#[tokio::test]
async fn request_rejections() {
    let test_app = TestApp::new(&[RESULT_LINE], |_| {});

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(json!({
            "model": "sonnet",
            "messages": [{"role": "assistant", "content": "Only me"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        payload,
        json!({
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "message": "No user message found in request"
            }
        })
    );

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(json!({
            "model": "sonnet",
            "messages": [{"role": "user", "content": "Weather?"}],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(payload["error"]["type"], "invalid_request_error");
    assert!(payload["error"]["message"]
        .as_str()
        .is_some_and(|message| message.starts_with("Tools/function calling is not supported")));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/anthropic/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"model\":"))
        .expect("request");
    let (status, bytes) = send_request(&test_app.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let payload: Value = serde_json::from_slice(&bytes).expect("error json");
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "invalid_request_error");

    // None of the above may reach the CLI.
    assert!(test_app.captured("args").is_none());
}

#[tokio::test]
async fn cli_failure_maps_to_api_error() {
    let test_app = TestApp::with_script("cat > /dev/null\necho 'rate limited' >&2\nexit 2\n");
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(basic_request(false)),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "api_error");
    assert_eq!(
        payload["error"]["message"],
        "Claude CLI failed (exit 2): rate limited"
    );
}

#[tokio::test]
async fn attachments_need_file_policy() {
    let test_app = TestApp::new(&[RESULT_LINE], |_| {});
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(image_request()),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["error"]["type"], "api_error");
    assert!(payload["error"]["message"]
        .as_str()
        .is_some_and(|message| message.contains("CLAUDE_ALLOWED_TOOLS_STR")));
    assert!(test_app.captured("args").is_none(), "CLI must not be spawned");
}

#[tokio::test]
async fn attachments_are_passed_by_path_and_removed() {
    let temp_dir = std::env::temp_dir();
    let test_app = TestApp::new(&[RESULT_LINE], |config| {
        config.allowed_tools = vec!["Read".to_string()];
        config.allowed_directories = vec![temp_dir.clone()];
    });
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(image_request()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "payload: {payload}");

    let args = test_app.captured("args").expect("cli args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.windows(2).any(|pair| pair == ["--allowed-tools", "Read"]));
    let temp_dir_arg = temp_dir.display().to_string();
    assert!(args
        .windows(2)
        .any(|pair| pair[0] == "--add-dir" && pair[1] == temp_dir_arg));

    let stdin = test_app.captured("stdin").expect("cli stdin");
    let attachment = stdin
        .lines()
        .find_map(|line| line.strip_prefix("Please use your Read tool to analyze this file: "))
        .map(PathBuf::from)
        .expect("attachment line");
    assert!(attachment.is_absolute());
    assert_eq!(attachment.extension().and_then(|ext| ext.to_str()), Some("png"));
    assert!(
        stdin.ends_with(&format!("\n\nWhat is in this image?\n[Image: {}]", attachment.display())),
        "stdin: {stdin}"
    );
    assert!(!attachment.exists(), "temp file should be removed after the response");
}

fn image_request() -> Value {
    json!({
        "model": "sonnet",
        "stream": false,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": "What is in this image?"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBORw0KGgo="}}
            ]
        }]
    })
}

async fn post_stream(app: &Router, body: Value) -> (StatusCode, String) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/anthropic/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    let (status, bytes) = send_request(app, request).await;
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn streamed_attachments_are_removed_after_the_body() {
    let temp_dir = std::env::temp_dir();
    let test_app = TestApp::new(STREAM_LINES, |config| {
        config.allowed_tools = vec!["Read".to_string()];
        config.allowed_directories = vec![temp_dir.clone()];
    });
    let mut request = image_request();
    request["stream"] = json!(true);
    let (status, body) = post_stream(&test_app.app, request).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");

    let names: Vec<String> = parse_sse(&body).into_iter().map(|(event, _)| event).collect();
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));

    let stdin = test_app.captured("stdin").expect("cli stdin");
    let attachment = stdin
        .lines()
        .find_map(|line| line.strip_prefix("Please use your Read tool to analyze this file: "))
        .map(PathBuf::from)
        .expect("attachment line");
    assert!(!attachment.exists(), "temp file should be removed once the stream ends");
}

#[tokio::test]
async fn stalled_stream_closes_after_partial_output() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let body = format!(
        "cat > /dev/null
echo '{}'
exec sleep 30
",
        STREAM_LINES[3]
    );
    let cli_path = write_script(dir.path(), &body);
    let config = BridgeConfig {
        claude_cli_path: cli_path,
        stream_idle_timeout: Duration::from_secs(1),
        kill_grace: Duration::from_millis(500),
        ..BridgeConfig::default()
    };
    let app = build_router(AppState::new(config));

    let (status, body) = post_stream(&app, basic_request(true)).await;
    assert_eq!(status, StatusCode::OK);
    let frames = parse_sse(&body);
    let names: Vec<&str> = frames.iter().map(|(event, _)| event.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(frames[2].1["delta"]["text"], "Hello");
    assert_eq!(frames[4].1["delta"]["stop_reason"], "end_turn");
}

#[tokio::test]
async fn health_reports_cli_status() {
    let test_app = TestApp::with_script("echo '2.1.0 (Claude Code)'\n");
    let (status, payload) = send_json(&test_app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "healthy");
    assert_eq!(payload["cli_available"], true);
    assert_eq!(payload["cli_version"], "2.1.0 (Claude Code)");

    let test_app = TestApp::with_script("exit 1\n");
    let (status, payload) = send_json(&test_app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "degraded");
    assert_eq!(payload["cli_available"], false);

    let (status, payload) = send_json(&test_app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["service"], "Claude Bridge");
    assert_eq!(payload["providers"], json!(["anthropic"]));
}

#[tokio::test]
async fn api_key_guards_messages_only() {
    let test_app = TestApp::new(&[RESULT_LINE], |config| {
        config.api_key = Some("secret".to_string());
    });

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/anthropic/v1/messages",
        Some(basic_request(false)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(payload["error"]["type"], "authentication_error");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/anthropic/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", "secret")
        .body(Body::from(basic_request(false).to_string()))
        .expect("request");
    let (status, _) = send_request(&test_app.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_json(&test_app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let test_app = TestApp::new(&[], |_| {});
    let (status, payload) = send_json(&test_app.app, Method::GET, "/v1/complete", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "not_found_error");
}
