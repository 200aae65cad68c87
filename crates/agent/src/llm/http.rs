use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::AgentError;

const BASE_BACKOFF_MS: u64 = 250;
const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// Sends the request built by `build`, retrying 429 and 5xx responses and transport
/// failures up to `max_retries` times with exponential backoff.
pub(crate) async fn send_json(
    provider: &str,
    max_retries: u32,
    build: impl Fn() -> RequestBuilder,
) -> Result<Value, AgentError> {
    let mut attempt = 0;
    loop {
        let last_attempt = attempt >= max_retries;
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.map_err(|error| {
                    AgentError::Model(format!("{provider} response could not be read: {error}"))
                })?;

                if status.is_success() {
                    return serde_json::from_str(&body).map_err(|error| {
                        AgentError::Model(format!(
                            "{provider} response parse error: {error}; body: {}",
                            truncate(&body)
                        ))
                    });
                }
                if !is_retryable(status) || last_attempt {
                    return Err(AgentError::Model(format!(
                        "{provider} API error {status}: {}",
                        truncate(&body)
                    )));
                }
                warn!(
                    event_name = "llm.retrying",
                    provider,
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    "model provider returned a retryable status"
                );
            }
            Err(error) => {
                if last_attempt || !(error.is_timeout() || error.is_connect()) {
                    return Err(AgentError::Model(format!("{provider} request failed: {error}")));
                }
                warn!(
                    event_name = "llm.retrying",
                    provider,
                    error = %error,
                    attempt = attempt + 1,
                    "model provider request failed in transport"
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(BASE_BACKOFF_MS << attempt.min(6))).await;
        attempt += 1;
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(body: &str) -> String {
    let count = body.chars().count();
    if count <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{head}...(+{} chars)", count - MAX_ERROR_BODY_CHARS)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{is_retryable, truncate, MAX_ERROR_BODY_CHARS};

    #[test]
    fn only_rate_limits_and_server_errors_are_retried() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY_CHARS + 10);
        assert!(truncate(&body).ends_with("...(+10 chars)"));
        assert_eq!(truncate("short"), "short");
    }
}
