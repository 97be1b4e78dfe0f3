//! Error types for the catalog client.

use std::time::Duration;

use reqwest::StatusCode;

/// Errors produced while talking to the backup catalog service.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("access token rejected by catalog")]
    Unauthorized,

    #[error("throttled by catalog (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    #[error("transient catalog error (HTTP {status}): {body}")]
    Transient {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("catalog API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("unexpected catalog response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CatalogError>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error codes the catalog uses to signal throttling in an error body.
const THROTTLE_ERROR_CODES: &[&str] = &["throttling", "toomanyrequests", "throttled"];

impl CatalogError {
    /// Classify a non-success HTTP response.
    pub fn from_response(status: StatusCode, body: String, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            return CatalogError::Unauthorized;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || is_throttle_body(&body) {
            return CatalogError::Throttled { retry_after };
        }
        if status.is_server_error() {
            return CatalogError::Transient {
                status: status.as_u16(),
                body,
                retry_after,
            };
        }
        CatalogError::Api {
            status: status.as_u16(),
            body,
        }
    }

    /// Whether the retry layer should attempt the call again.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Throttled { .. } | CatalogError::Transient { .. } => true,
            CatalogError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Server-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CatalogError::Throttled { retry_after } => *retry_after,
            CatalogError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return CatalogError::Decode(err.to_string());
        }
        // Only a failed connect proves the server never saw the request. A
        // timed-out POST may already have started a restore session.
        CatalogError::Transport {
            retryable: err.is_connect() && !err.is_timeout(),
            message: err.to_string(),
        }
    }
}

fn is_throttle_body(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    value
        .get("errorCode")
        .and_then(|code| code.as_str())
        .map(|code| {
            let code = code.to_ascii_lowercase();
            THROTTLE_ERROR_CODES.contains(&code.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CatalogError::from_response(StatusCode::UNAUTHORIZED, String::new(), None),
            CatalogError::Unauthorized
        ));
        assert!(CatalogError::from_response(StatusCode::TOO_MANY_REQUESTS, String::new(), None)
            .is_transient());
        assert!(CatalogError::from_response(StatusCode::BAD_GATEWAY, String::new(), None)
            .is_transient());
        assert!(!CatalogError::from_response(StatusCode::NOT_FOUND, String::new(), None)
            .is_transient());
        assert!(!CatalogError::from_response(StatusCode::BAD_REQUEST, String::new(), None)
            .is_transient());
    }

    #[test]
    fn test_explicit_throttle_code_in_body() {
        let body = r#"{"errorCode":"TooManyRequests","message":"slow down"}"#.to_string();
        let err = CatalogError::from_response(StatusCode::BAD_REQUEST, body, None);
        assert!(matches!(err, CatalogError::Throttled { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_plain_text_mentioning_429_is_not_throttle() {
        let err = CatalogError::from_response(
            StatusCode::BAD_REQUEST,
            "error 429 Too Many Requests".to_string(),
            None,
        );
        assert!(matches!(err, CatalogError::Api { status: 400, .. }));
    }

    #[test]
    fn test_retry_after_exposed() {
        let err = CatalogError::from_response(
            StatusCode::SERVICE_UNAVAILABLE,
            String::new(),
            Some(Duration::from_secs(7)),
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = reqwest::get(format!("http://127.0.0.1:{port}/api/v1/jobs"))
            .await
            .unwrap_err();
        let err = CatalogError::from(err);
        assert!(err.is_transient());
    }
}
