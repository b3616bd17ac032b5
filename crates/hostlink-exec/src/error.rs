//! Error types for hostlink-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a remote host
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Host key refused by the verification policy
    #[error("host key rejected for {host}: {reason}")]
    HostKeyRejected {
        /// `host:port` that presented the key
        host: String,
        /// Why the key was refused
        reason: String,
    },

    /// File transfer failed
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Could not open or drive a command channel
    #[error("command execution failed: {0}")]
    ExecutionFailed(String),

    /// No channel activity within the caller's timeout
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Malformed call, e.g. a directory without the recursive flag
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

/// Coarse classification of [`ExecError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport or copy channel could not be established
    Connection,
    /// `get`/`put` failure
    Transfer,
    /// Command channel could not be opened
    Execution,
    /// No activity within the timeout
    Timeout,
    /// Malformed call
    InvalidArgument,
    /// Bad configuration
    Config,
}

impl ExecError {
    /// Taxonomy bucket this error belongs to
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::ConnectionFailed(_)
            | ExecError::AuthenticationFailed(_)
            | ExecError::HostKeyRejected { .. } => ErrorKind::Connection,
            ExecError::TransferFailed(_) => ErrorKind::Transfer,
            ExecError::ExecutionFailed(_) => ErrorKind::Execution,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ExecError::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// Check if error is worth retrying by the caller
    ///
    /// Nothing in this crate retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    pub(crate) fn transfer(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        ExecError::TransferFailed(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_family_shares_kind() {
        let errors = [
            ExecError::ConnectionFailed("refused".to_string()),
            ExecError::AuthenticationFailed("bad password".to_string()),
            ExecError::HostKeyRejected {
                host: "example:22".to_string(),
                reason: "unknown".to_string(),
            },
        ];

        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Connection);
        }
    }

    #[test]
    fn test_retryable() {
        assert!(ExecError::Timeout {
            timeout: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!ExecError::AuthenticationFailed("nope".to_string()).is_retryable());
        assert!(!ExecError::InvalidArgument("dir".to_string()).is_retryable());
    }

    #[test]
    fn test_display_keeps_collaborator_message() {
        let err = ExecError::transfer("/srv/missing", "no such file");
        assert_eq!(err.to_string(), "transfer failed: /srv/missing: no such file");
    }
}
