//! Errors surfaced by API collaborators.

use crate::api::NodeKey;
use thiserror::Error;

/// Errors that can occur during collaborator calls.
///
/// Collaborators own their timeout policy; a timeout is reported like
/// any other failure and handled identically by the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// The requested key does not exist upstream.
    #[error("key {key} not found upstream")]
    NotFound { key: NodeKey },

    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The collaborator returned data the client could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The collaborator gave up waiting.
    #[error("request timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_found() {
        let err = ApiError::NotFound {
            key: NodeKey::from("n1"),
        };
        assert!(err.to_string().contains("n1"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_display_http() {
        let err = ApiError::Http("503".to_string());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = ApiError::Timeout;
        assert_eq!(err.clone(), err);
    }
}
