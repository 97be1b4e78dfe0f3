//! Error types for the cloud provider seam.

/// Errors produced by cloud management-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("cloud API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("cloud operation failed: {0}")]
    OperationFailed(String),

    #[error("cloud authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected cloud response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CloudError::Decode(err.to_string())
        } else {
            CloudError::Transport(err.to_string())
        }
    }
}
