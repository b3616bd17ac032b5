//! Connection parameters shared by every backend

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Default time allowed for connect + authenticate
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Plaintext password, redacted from `Debug` output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wrap a plaintext password
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Connection information for SSH
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    pub port: u16,
    /// Username
    pub user: String,
    /// Password for password authentication
    pub password: Password,
    /// Limit on connect + authenticate
    pub connect_timeout: Duration,
}

impl ConnectionInfo {
    /// Create new connection info on the default port
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: Password) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` label used in logs and errors
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let info = ConnectionInfo::new("db1", "deploy", Password::new("s3cret"));
        assert_eq!(info.port, 22);
        assert_eq!(info.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(info.address(), "db1:22");
    }

    #[test]
    fn test_password_is_redacted() {
        let info = ConnectionInfo::new("db1", "deploy", Password::new("s3cret")).with_port(2222);
        let rendered = format!("{info:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("2222"));
    }
}
