//! GLM chat-completions gateway
//!
//! Talks to an OpenAI-compatible `/chat/completions` endpoint with `stream: true`
//! and turns its server-sent events into [`StreamDelta`] values.

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{stream::BoxStream, StreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, RequestBuilder,
};
use serde::Deserialize;
use serde_json::json;
use std::{collections::VecDeque, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    llm::{
        errors::{classify_error_code, classify_status, classify_transport, extract_error_message, GatewayError, GatewayResult},
        gateway::{either_cancelled, ModelGateway},
        types::{ChatTurn, DeltaStream, StreamDelta, TokenUsage},
    },
    store::FailureKind,
    version,
};

pub const DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const DEFAULT_MODEL: &str = "glm-4";

/// Settings for [`GlmGateway`]
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub connect_timeout: Duration,
    /// Longest silence tolerated while waiting for the response or the next chunk
    pub read_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Streaming gateway for GLM models
pub struct GlmGateway {
    client: Client,
    settings: GatewaySettings,
    endpoint: String,
    lifecycle: CancellationToken,
}

impl GlmGateway {
    /// Create a new gateway
    pub fn new(settings: GatewaySettings) -> GatewayResult<Self> {
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GatewayError::ConfigError("API key is required".to_string()))?;

        if settings.model.trim().is_empty() {
            return Err(GatewayError::ConfigError("Model is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| GatewayError::ConfigError(format!("Invalid API key: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout)
            .user_agent(version::user_agent())
            .build()?;

        let endpoint = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            settings,
            endpoint,
            lifecycle: CancellationToken::new(),
        })
    }

    /// The full completions URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, history: &[ChatTurn]) -> serde_json::Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": history,
            "stream": true,
        });

        if let Some(temperature) = self.settings.temperature {
            body["temperature"] = json!(temperature);
        }

        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }
}

impl ModelGateway for GlmGateway {
    fn stream_completion(&self, history: Vec<ChatTurn>, cancel: CancellationToken) -> DeltaStream {
        debug!(
            "Opening completion stream: model={} turns={}",
            self.settings.model,
            history.len()
        );

        let request = self.client.post(&self.endpoint).json(&self.request_body(&history));
        let reader = DeltaReader::new(
            request,
            cancel,
            self.lifecycle.clone(),
            self.settings.read_timeout,
        );

        Box::pin(futures::stream::unfold(reader, |mut reader| async move {
            reader.next_delta().await.map(|delta| (delta, reader))
        }))
    }

    fn name(&self) -> &str {
        "glm"
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn shutdown(&self) {
        debug!("Shutting down GLM gateway");
        self.lifecycle.cancel();
    }
}

/// Drives one request from connect to the terminal delta
struct DeltaReader {
    request: Option<RequestBuilder>,
    body: Option<BoxStream<'static, Result<Event, EventStreamError<reqwest::Error>>>>,
    pending: VecDeque<StreamDelta>,
    cancel: CancellationToken,
    lifecycle: CancellationToken,
    read_timeout: Duration,
    terminal_queued: bool,
    done: bool,
}

impl DeltaReader {
    fn new(
        request: RequestBuilder,
        cancel: CancellationToken,
        lifecycle: CancellationToken,
        read_timeout: Duration,
    ) -> Self {
        Self {
            request: Some(request),
            body: None,
            pending: VecDeque::new(),
            cancel,
            lifecycle,
            read_timeout,
            terminal_queued: false,
            done: false,
        }
    }

    async fn next_delta(&mut self) -> Option<StreamDelta> {
        if self.done {
            return None;
        }

        let delta = self.produce().await;
        if delta.is_terminal() {
            self.done = true;
            self.body = None;
            if let StreamDelta::Failed { kind, detail } = &delta {
                warn!("Completion stream failed ({}): {}", kind, detail);
            }
        }
        Some(delta)
    }

    async fn produce(&mut self) -> StreamDelta {
        if let Some(request) = self.request.take() {
            if let Err(delta) = self.connect(request).await {
                return delta;
            }
        }

        loop {
            if let Some(delta) = self.pending.pop_front() {
                return delta;
            }

            let Some(body) = self.body.as_mut() else {
                return StreamDelta::failed(FailureKind::Transport, "response body unavailable");
            };

            let read = tokio::select! {
                biased;
                _ = either_cancelled(&self.cancel, &self.lifecycle) => return StreamDelta::cancelled(),
                read = tokio::time::timeout(self.read_timeout, body.next()) => read,
            };

            match read {
                Err(_) => {
                    return StreamDelta::failed(
                        FailureKind::Timeout,
                        format!("no data received within {}s", self.read_timeout.as_secs()),
                    );
                }
                Ok(Some(Ok(event))) => self.handle_data(&event.data),
                Ok(Some(Err(EventStreamError::Transport(e)))) => {
                    return StreamDelta::failed(classify_transport(&e), e.to_string());
                }
                Ok(Some(Err(e))) => {
                    return StreamDelta::failed(
                        FailureKind::InvalidResponse,
                        format!("malformed event stream: {}", e),
                    );
                }
                Ok(None) => {
                    return StreamDelta::failed(
                        FailureKind::Transport,
                        "connection closed before the completion marker",
                    );
                }
            }
        }
    }

    async fn connect(&mut self, request: RequestBuilder) -> Result<(), StreamDelta> {
        let sent = tokio::select! {
            biased;
            _ = either_cancelled(&self.cancel, &self.lifecycle) => return Err(StreamDelta::cancelled()),
            sent = tokio::time::timeout(self.read_timeout, request.send()) => sent,
        };

        let response = match sent {
            Err(_) => {
                return Err(StreamDelta::failed(
                    FailureKind::Timeout,
                    format!("no response within {}s", self.read_timeout.as_secs()),
                ));
            }
            Ok(Err(e)) => return Err(StreamDelta::failed(classify_transport(&e), e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let kind = classify_status(status);
            let detail = tokio::time::timeout(self.read_timeout, extract_error_message(response))
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(StreamDelta::failed(kind, detail));
        }

        debug!("Completion stream connected: {}", status);
        self.body = Some(response.bytes_stream().eventsource().boxed());
        Ok(())
    }

    /// Turn one SSE payload into queued deltas
    fn handle_data(&mut self, data: &str) {
        if self.terminal_queued {
            return;
        }

        let data = data.trim();
        if data.is_empty() {
            return;
        }

        if data == "[DONE]" {
            self.queue_terminal(StreamDelta::Finished {
                finish_reason: None,
                usage: None,
            });
            return;
        }

        let chunk: GlmChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.queue_terminal(StreamDelta::failed(
                    FailureKind::InvalidResponse,
                    format!("malformed stream payload: {}", e),
                ));
                return;
            }
        };

        if let Some(error) = chunk.error {
            let code = error.code.as_ref().map(code_to_string);
            let message = error.message.unwrap_or_else(|| "provider error".to_string());
            let kind = classify_error_code(code.as_deref(), &message);
            self.queue_terminal(StreamDelta::failed(kind, message));
            return;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.and_then(|delta| delta.content) {
            if !content.is_empty() {
                self.pending.push_back(StreamDelta::Token { text: content });
            }
        }

        if let Some(reason) = choice.finish_reason {
            let terminal = match reason.as_str() {
                "network_error" => {
                    StreamDelta::failed(FailureKind::Transport, "provider reported a network error")
                }
                "sensitive" => {
                    StreamDelta::failed(FailureKind::Rejected, "response blocked by content filter")
                }
                _ => StreamDelta::Finished {
                    finish_reason: Some(reason),
                    usage: chunk.usage,
                },
            };
            self.queue_terminal(terminal);
        }
    }

    fn queue_terminal(&mut self, delta: StreamDelta) {
        self.pending.push_back(delta);
        self.terminal_queued = true;
    }
}

fn code_to_string(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// GLM streaming payload types
#[derive(Debug, Deserialize)]
struct GlmChunk {
    #[serde(default)]
    choices: Vec<GlmChoice>,
    usage: Option<TokenUsage>,
    error: Option<GlmError>,
}

#[derive(Debug, Deserialize)]
struct GlmChoice {
    delta: Option<GlmDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlmDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlmError {
    code: Option<serde_json::Value>,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;

    fn settings() -> GatewaySettings {
        GatewaySettings {
            api_key: Some("test-key".to_string()),
            ..GatewaySettings::default()
        }
    }

    fn reader() -> DeltaReader {
        let request = Client::new().post("http://localhost/unused");
        DeltaReader::new(
            request,
            CancellationToken::new(),
            CancellationToken::new(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_new_requires_api_key() {
        let err = GlmGateway::new(GatewaySettings::default()).err().unwrap();
        assert!(matches!(err, GatewayError::ConfigError(_)));

        let blank = GatewaySettings {
            api_key: Some("  ".to_string()),
            ..GatewaySettings::default()
        };
        assert!(GlmGateway::new(blank).is_err());
    }

    #[test]
    fn test_endpoint_and_request_body() {
        let gateway = GlmGateway::new(GatewaySettings {
            base_url: "http://example.test/v4/".to_string(),
            temperature: Some(0.5),
            ..settings()
        })
        .unwrap();
        assert_eq!(gateway.endpoint(), "http://example.test/v4/chat/completions");

        let body = gateway.request_body(&[
            ChatTurn::new(Role::System, "be brief"),
            ChatTurn::new(Role::User, "Hello"),
        ]);
        assert_eq!(body["model"], "glm-4");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
    }

    #[test]
    fn test_handle_data_tokens_and_finish() {
        let mut reader = reader();
        reader.handle_data(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"}}]}"#);
        reader.handle_data(
            r#"{"choices":[{"index":0,"delta":{"content":" there"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
        );
        reader.handle_data("[DONE]");

        let deltas: Vec<_> = reader.pending.drain(..).collect();
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0], StreamDelta::token("Hi"));
        assert_eq!(deltas[1], StreamDelta::token(" there"));
        match &deltas[2] {
            StreamDelta::Finished { finish_reason, usage } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(usage.as_ref().map(|u| u.total_tokens), Some(5));
            }
            other => panic!("unexpected delta: {:?}", other),
        }
    }

    #[test]
    fn test_handle_data_error_payloads() {
        let mut reader = reader();
        reader.handle_data(r#"{"error":{"code":"1302","message":"too many concurrent requests"}}"#);
        assert!(matches!(
            reader.pending.pop_front(),
            Some(StreamDelta::Failed { kind: FailureKind::RateLimited, .. })
        ));

        let mut reader = self::reader();
        reader.handle_data("{not json");
        assert!(matches!(
            reader.pending.pop_front(),
            Some(StreamDelta::Failed { kind: FailureKind::InvalidResponse, .. })
        ));
        reader.handle_data(r#"{"choices":[{"delta":{"content":"ignored"}}]}"#);
        assert!(reader.pending.is_empty());
    }

    #[test]
    fn test_sensitive_finish_is_rejected() {
        let mut reader = reader();
        reader.handle_data(r#"{"choices":[{"delta":{"content":"par"},"finish_reason":"sensitive"}]}"#);
        assert_eq!(reader.pending.pop_front(), Some(StreamDelta::token("par")));
        assert!(matches!(
            reader.pending.pop_front(),
            Some(StreamDelta::Failed { kind: FailureKind::Rejected, .. })
        ));
    }
}
