//! Error mapping shared by the HTTP collaborator clients.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → transient, retried by the policy engine
//! - Other non-success statuses → internal, never retried
//! - Network errors and client-side timeouts → transient

use reqwest::StatusCode;

use memory_agent_core::MemoryError;

pub(crate) fn status_error(service: &str, status: StatusCode, body: &str) -> MemoryError {
    let detail = format!(
        "{service} API error {status}: {}",
        body.chars().take(500).collect::<String>()
    );
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        MemoryError::transient(detail)
    } else {
        MemoryError::internal(detail)
    }
}

pub(crate) fn send_error(service: &str, err: reqwest::Error) -> MemoryError {
    MemoryError::transient(format!("{service} request failed: {err}"))
}

/// Send a JSON POST and decode the JSON response, mapping failures.
pub(crate) async fn post_json(
    service: &str,
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
) -> Result<serde_json::Value, MemoryError> {
    let response = request
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| send_error(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(service, status, &text));
    }
    response
        .json()
        .await
        .map_err(|e| MemoryError::transient(format!("{service} returned an unreadable body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(status_error("x", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(status_error("x", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!status_error("x", StatusCode::UNAUTHORIZED, "").is_retryable());
        let long = "y".repeat(2_000);
        let err = status_error("x", StatusCode::BAD_REQUEST, &long);
        assert!(err.to_string().len() < 700);
    }
}
