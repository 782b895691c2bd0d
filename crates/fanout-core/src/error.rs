//! Error types for Fanout

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{InstanceId, InstanceStatus};

/// Result type for fanout operations
pub type Result<T> = std::result::Result<T, FanoutError>;

/// A network call or external process could not complete.
///
/// Carries the raw diagnostic text of the underlying failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or was cut mid-exchange
    #[error("connection failed: {0}")]
    Connection(String),

    /// External program could not be started
    #[error("failed to run `{program}`: {detail}")]
    Spawn { program: String, detail: String },

    /// External program ran but exited unsuccessfully
    #[error("`{program}` exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl TransportError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }
}

/// Errors that can occur while provisioning and deploying jobs
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Network or process-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The vendor rejected the request with an error envelope
    #[error("API error [{code}]: {message}{}", .suggestion.as_ref().map(|s| format!(" (suggestion: {s})")).unwrap_or_default())]
    Api {
        code: String,
        message: String,
        suggestion: Option<String>,
    },

    /// The response body was not a JSON document
    #[error("malformed API response: {0}")]
    MalformedResponse(String),

    /// Launch reported success but returned no instance ids
    #[error("no instance IDs returned from launch request")]
    EmptyLaunchResult,

    /// Instance entered a failure state while waiting for readiness
    #[error("instance {instance_id} entered {status} state")]
    FatalInstanceState {
        instance_id: InstanceId,
        status: InstanceStatus,
    },

    /// Required secret file is absent
    #[error("secret file not found at {}", .0.display())]
    MissingSecret(PathBuf),

    /// Bundle could not be built
    #[error("packaging error: {0}")]
    Packaging(String),

    /// Bundle transfer failed
    #[error("deployment error: {0}")]
    Deployment(#[source] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Requested job is not in the catalog
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FanoutError {
    /// Create an API error from envelope parts
    pub fn api(
        code: impl Into<String>,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
            suggestion,
        }
    }

    /// Create a packaging error
    pub fn packaging(msg: impl Into<String>) -> Self {
        Self::Packaging(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Errors that must abort a run before any instance is launched
    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::MissingSecret(_) | Self::Packaging(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_with_suggestion() {
        let err = FanoutError::api(
            "instance-operations/launch/insufficient-capacity",
            "Not enough capacity",
            Some("Try another region".to_string()),
        );
        let text = err.to_string();
        assert!(text.contains("[instance-operations/launch/insufficient-capacity]"));
        assert!(text.contains("Not enough capacity"));
        assert!(text.contains("Try another region"));
    }

    #[test]
    fn test_api_error_display_without_suggestion() {
        let err = FanoutError::api("global/invalid-api-key", "bad key", None);
        assert_eq!(err.to_string(), "API error [global/invalid-api-key]: bad key");
    }

    #[test]
    fn test_exit_error_display() {
        let err = TransportError::Exit {
            program: "scp".to_string(),
            code: Some(1),
            stderr: "Permission denied".to_string(),
        };
        assert_eq!(err.to_string(), "`scp` exited with status 1: Permission denied");

        let killed = TransportError::Exit {
            program: "scp".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn test_preflight_classification() {
        assert!(FanoutError::MissingSecret(PathBuf::from(".env")).is_preflight());
        assert!(FanoutError::packaging("tar failed").is_preflight());
        assert!(!FanoutError::EmptyLaunchResult.is_preflight());
        assert!(!FanoutError::api("x", "y", None).is_preflight());
    }
}
