use std::time::Duration;

use futures::StreamExt;
use parley::{
    llm::{ChatTurn, GatewaySettings, GlmGateway, ModelGateway, StreamDelta},
    store::{FailureKind, Role},
};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn gateway(server: &MockServer, read_timeout: Duration) -> GlmGateway {
    gateway_at(server.uri(), read_timeout)
}

fn gateway_at(base_url: String, read_timeout: Duration) -> GlmGateway {
    GlmGateway::new(GatewaySettings {
        api_key: Some("test-key".to_string()),
        base_url,
        read_timeout,
        ..GatewaySettings::default()
    })
    .unwrap()
}

/// Serve one request: send the headers and a single event, then keep the
/// connection open without writing anything else.
async fn stalling_server(first_event: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_lowercase();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }

        let event = format!("data: {}\n\n", first_event);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            event.len(),
            event
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    format!("http://{}", addr)
}

fn history() -> Vec<ChatTurn> {
    vec![ChatTurn::new(Role::User, "Hello")]
}

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|frame| format!("data: {}\n\n", frame)).collect()
}

fn event_stream(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

async fn collect(gateway: &GlmGateway) -> Vec<StreamDelta> {
    tokio::time::timeout(
        Duration::from_secs(5),
        gateway.stream_completion(history(), CancellationToken::new()).collect::<Vec<_>>(),
    )
    .await
    .unwrap()
}

fn failure_kind(deltas: &[StreamDelta]) -> Option<FailureKind> {
    match deltas.last() {
        Some(StreamDelta::Failed { kind, .. }) => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn test_streams_tokens_until_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "glm-4",
            "stream": true,
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .respond_with(event_stream(sse(&[
            r#"{"id":"1","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"id":"1","choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"id":"1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#,
            "[DONE]",
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let deltas = collect(&gateway(&server, Duration::from_secs(5))).await;
    assert_eq!(deltas.len(), 3);
    assert_eq!(deltas[0], StreamDelta::token("Hel"));
    assert_eq!(deltas[1], StreamDelta::token("lo"));
    assert!(matches!(
        &deltas[2],
        StreamDelta::Finished { finish_reason: Some(reason), .. } if reason == "stop"
    ));
}

#[tokio::test]
async fn test_http_errors_are_classified() {
    let cases = [
        (429, FailureKind::RateLimited),
        (500, FailureKind::Transport),
        (503, FailureKind::Transport),
        (401, FailureKind::Rejected),
        (400, FailureKind::Rejected),
    ];

    for (status, expected) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(json!({"error": {"code": "1000", "message": "provider says no"}})),
            )
            .mount(&server)
            .await;

        let deltas = collect(&gateway(&server, Duration::from_secs(5))).await;
        assert_eq!(deltas.len(), 1, "status {}", status);
        assert_eq!(failure_kind(&deltas), Some(expected), "status {}", status);
        match &deltas[0] {
            StreamDelta::Failed { detail, .. } => assert!(detail.contains("provider says no")),
            other => panic!("unexpected delta {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&["[DONE]"])).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let deltas = collect(&gateway(&server, Duration::from_millis(100))).await;
    assert_eq!(failure_kind(&deltas), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_body_stalling_after_first_token_times_out() {
    let base_url = stalling_server(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).await;
    let gateway = gateway_at(base_url, Duration::from_millis(200));

    let deltas = collect(&gateway).await;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0], StreamDelta::token("Hi"));
    assert_eq!(failure_kind(&deltas), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_malformed_payload_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&[
            r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
            "{this is not json",
            r#"{"choices":[{"delta":{"content":"never seen"}}]}"#,
        ])))
        .mount(&server)
        .await;

    let deltas = collect(&gateway(&server, Duration::from_secs(5))).await;
    assert_eq!(deltas.len(), 2);
    assert_eq!(deltas[0], StreamDelta::token("ok"));
    assert_eq!(failure_kind(&deltas), Some(FailureKind::InvalidResponse));
}

#[tokio::test]
async fn test_stream_without_completion_marker_is_transport() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&[r#"{"choices":[{"delta":{"content":"cut"}}]}"#])))
        .mount(&server)
        .await;

    let deltas = collect(&gateway(&server, Duration::from_secs(5))).await;
    assert_eq!(deltas[0], StreamDelta::token("cut"));
    assert_eq!(failure_kind(&deltas), Some(FailureKind::Transport));
}

#[tokio::test]
async fn test_in_stream_error_object() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&[
            r#"{"error":{"code":"1302","message":"High concurrency usage"}}"#,
        ])))
        .mount(&server)
        .await;

    let deltas = collect(&gateway(&server, Duration::from_secs(5))).await;
    assert_eq!(deltas.len(), 1);
    assert_eq!(failure_kind(&deltas), Some(FailureKind::RateLimited));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&["[DONE]"])).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let gateway = gateway(&server, Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let mut stream = gateway.stream_completion(history(), cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let first = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert_eq!(first, Some(StreamDelta::cancelled()));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_shutdown_stops_new_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&["[DONE]"])))
        .expect(0)
        .mount(&server)
        .await;

    let gateway = gateway(&server, Duration::from_secs(5));
    gateway.shutdown();

    let deltas = collect(&gateway).await;
    assert_eq!(deltas, vec![StreamDelta::cancelled()]);
}
