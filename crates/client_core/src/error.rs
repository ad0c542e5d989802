use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The session could not be recovered; the user has been sent to login.
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("HTTP error! status: {status}{}", detail_suffix(.detail))]
    Status {
        status: StatusCode,
        detail: Option<String>,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// Failure of a request whose result was shared between several callers.
    #[error(transparent)]
    Shared(Arc<ClientError>),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Shared(inner) => inner.status(),
            _ => None,
        }
    }

    pub fn is_auth_required(&self) -> bool {
        match self {
            ClientError::AuthenticationRequired => true,
            ClientError::Shared(inner) => inner.is_auth_required(),
            _ => false,
        }
    }

    /// Message suitable for a transient notification.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Status {
                detail: Some(detail),
                ..
            } => detail.clone(),
            ClientError::Shared(inner) => inner.user_message(),
            _ => "An error occurred".to_string(),
        }
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed for {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("storage file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to encode storage: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_auth_checks_see_through_shared_errors() {
        let shared = ClientError::Shared(Arc::new(ClientError::Status {
            status: StatusCode::NOT_FOUND,
            detail: Some("Not found.".into()),
        }));
        assert_eq!(shared.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(shared.user_message(), "Not found.");
        assert!(!shared.is_auth_required());

        let auth = ClientError::Shared(Arc::new(ClientError::AuthenticationRequired));
        assert!(auth.is_auth_required());
    }

    #[test]
    fn status_error_mentions_code() {
        let err = ClientError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: None,
        };
        assert_eq!(err.to_string(), "HTTP error! status: 500 Internal Server Error");
    }
}
