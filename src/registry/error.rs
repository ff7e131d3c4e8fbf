//! Error types and HTTP status handlers for registry operations

use reqwest::StatusCode;
use thiserror::Error;

use crate::transfer::policy::PolicyRejection;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("upload error: {0}")]
    Upload(String),

    #[error("image parsing error: {0}")]
    ImageParsing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    PolicyRejected(#[from] PolicyRejection),

    #[error("not supported: {0}")]
    Unsupported(String),
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Registry(format!("invalid registry URL: {}", err))
    }
}

const MAX_BODY_IN_ERROR: usize = 200;

/// First line of a registry error body, bounded so HTML error pages stay readable.
fn summarize(body: &str) -> String {
    let line = body.trim().lines().next().unwrap_or_default();
    match line.char_indices().nth(MAX_BODY_IN_ERROR) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

/// Maps unexpected HTTP statuses from the push flow to errors.
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Blob upload and manifest PUT failures.
    pub fn handle_upload_error(status: StatusCode, body: &str, context: &str) -> RegistryError {
        let message = match status {
            StatusCode::BAD_REQUEST if body.contains("DIGEST_INVALID") => {
                format!("registry rejected the digest of {}", context)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("registry denied access to {} ({})", context, status)
            }
            StatusCode::NOT_FOUND => format!("{}: repository or upload session not found", context),
            _ => format!("{} failed with status {}: {}", context, status, summarize(body)),
        };
        RegistryError::Upload(message)
    }

    /// Token service failures. The body is left out for credential errors,
    /// since some token services echo the request back.
    pub fn handle_auth_error(status: StatusCode, body: &str) -> RegistryError {
        let message = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("token service rejected the destination credentials ({})", status)
            }
            _ => format!("token request failed with status {}: {}", status, summarize(body)),
        };
        RegistryError::Auth(message)
    }

    /// Version check and blob existence failures.
    pub fn handle_registry_error(status: StatusCode, body: &str, operation: &str) -> RegistryError {
        let message = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                format!("registry denied access to {} ({})", operation, status)
            }
            StatusCode::TOO_MANY_REQUESTS => format!("registry rate limited {}", operation),
            _ => format!("{} failed with status {}: {}", operation, status, summarize(body)),
        };
        RegistryError::Registry(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_mention_context() {
        let err = HttpErrorHandler::handle_upload_error(StatusCode::FORBIDDEN, "denied", "blob upload");
        assert_eq!(
            err.to_string(),
            "upload error: registry denied access to blob upload (403 Forbidden)"
        );
    }

    #[test]
    fn digest_mismatch_is_called_out() {
        let err = HttpErrorHandler::handle_upload_error(
            StatusCode::BAD_REQUEST,
            r#"{"errors":[{"code":"DIGEST_INVALID"}]}"#,
            "blob upload",
        );
        assert!(err.to_string().contains("rejected the digest of blob upload"));
    }

    #[test]
    fn auth_errors_do_not_echo_the_response_for_credential_failures() {
        let err = HttpErrorHandler::handle_auth_error(StatusCode::UNAUTHORIZED, "password=hunter2");
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn long_bodies_are_cut() {
        let body = format!("{}\nsecond line", "x".repeat(500));
        let err = HttpErrorHandler::handle_registry_error(StatusCode::BAD_GATEWAY, &body, "version check");
        let text = err.to_string();
        assert!(text.ends_with("..."));
        assert!(!text.contains("second line"));
    }

    #[test]
    fn wrapped_errors_do_not_repeat_their_cause() {
        let err = RegistryError::from(std::io::Error::other("disk full"));
        assert_eq!(err.to_string(), "disk full");
        assert!(std::error::Error::source(&err).is_none());
    }
}
