//! Error types and fault classification for the model gateway

use reqwest::StatusCode;
use thiserror::Error;

use crate::store::FailureKind;

/// Errors raised while building a gateway.
///
/// Faults during a request are never raised. They become
/// [`StreamDelta::Failed`](super::StreamDelta::Failed) values instead.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Provider error codes that mean "slow down" (concurrency, frequency and
/// volume limits)
const RATE_LIMIT_CODES: &[&str] = &["1302", "1303", "1305"];

/// Map a non-success HTTP status to a failure kind
pub fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        429 => FailureKind::RateLimited,
        408 => FailureKind::Transport,
        _ if status.is_server_error() => FailureKind::Transport,
        _ => FailureKind::Rejected,
    }
}

/// Map a transport-level reqwest error to a failure kind
pub fn classify_transport(error: &reqwest::Error) -> FailureKind {
    if error.is_timeout() {
        FailureKind::Timeout
    } else if error.is_decode() {
        FailureKind::InvalidResponse
    } else if let Some(status) = error.status() {
        classify_status(status)
    } else {
        FailureKind::Transport
    }
}

/// Map an error object embedded in the stream to a failure kind
pub fn classify_error_code(code: Option<&str>, message: &str) -> FailureKind {
    let rate_limited = code.is_some_and(|code| RATE_LIMIT_CODES.contains(&code))
        || message.to_lowercase().contains("rate limit");
    if rate_limited {
        FailureKind::RateLimited
    } else {
        FailureKind::Rejected
    }
}

/// Extract a readable message from an error response body
pub async fn extract_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                if let Some(message) = json
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(|message| message.as_str())
                {
                    return format!("{}: {}", status, message);
                }
            }
            if text.trim().is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, text.trim())
            }
        }
        Err(_) => format!("{}: failed to read error response", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::RateLimited);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureKind::Transport);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), FailureKind::Transport);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureKind::Rejected);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureKind::Rejected);
    }

    #[test]
    fn test_classify_error_code() {
        assert_eq!(classify_error_code(Some("1302"), "busy"), FailureKind::RateLimited);
        assert_eq!(
            classify_error_code(None, "Rate limit reached for requests"),
            FailureKind::RateLimited
        );
        assert_eq!(classify_error_code(Some("1214"), "bad messages"), FailureKind::Rejected);
    }
}
