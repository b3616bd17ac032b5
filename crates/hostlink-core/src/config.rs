//! Session configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostlink_exec::{
    ConnectionInfo, DEFAULT_PORT, ExecError, HostKeyPolicy, KnownHosts, Password, RusshConnector,
};

/// Everything needed to open a [`crate::SshSession`]
///
/// There are no default credentials: `user` and `password` must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// IP address or hostname
    pub host: String,
    /// SSH port (defaults to 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// User to authenticate as
    pub user: String,
    /// Password for password authentication
    pub password: Password,
    /// Limit on connect + authenticate, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// What to do with unknown host keys
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// `known_hosts` file to seed the key store from (defaults to `~/.ssh/known_hosts`)
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl SessionConfig {
    /// Create config with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: Password) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user: user.into(),
            password,
            connect_timeout_secs: default_connect_timeout_secs(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set host key policy
    #[must_use]
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Seed host keys from a specific `known_hosts` file
    #[must_use]
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Parse TOML
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the document is invalid
    pub fn from_toml_str(content: &str) -> Result<Self, ExecError> {
        toml::from_str(content).map_err(|e| ExecError::ConfigError(e.to_string()))
    }

    /// Load configuration from file
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, ExecError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExecError::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Connection parameters handed to the connector
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(&self.host, &self.user, self.password.clone())
            .with_port(self.port)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// russh connector honouring the host key settings
    #[must_use]
    pub fn connector(&self) -> RusshConnector {
        let known_hosts = match &self.known_hosts {
            Some(path) => KnownHosts::load_or_empty(path),
            None => KnownHosts::system(),
        };
        RusshConnector::new(self.host_key_policy, Arc::new(known_hosts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            host = "nas.lan"
            user = "backup"
            password = "correct horse"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.host_key_policy, HostKeyPolicy::AutoAdd);
        assert!(config.known_hosts.is_none());
        assert_eq!(config.password.expose(), "correct horse");
    }

    #[test]
    fn test_full_toml() {
        let config = SessionConfig::from_toml_str(
            r#"
            host = "nas.lan"
            port = 2222
            user = "backup"
            password = "pw"
            connect_timeout_secs = 5
            host_key_policy = "reject"
            known_hosts = "/etc/ssh/ssh_known_hosts"
            "#,
        )
        .unwrap();

        let info = config.connection_info();
        assert_eq!(info.port, 2222);
        assert_eq!(info.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.host_key_policy, HostKeyPolicy::Reject);
        assert_eq!(
            config.known_hosts.as_deref(),
            Some(Path::new("/etc/ssh/ssh_known_hosts"))
        );
    }

    #[test]
    fn test_credentials_are_required() {
        let result = SessionConfig::from_toml_str(r#"host = "nas.lan""#);
        assert!(matches!(result, Err(ExecError::ConfigError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostlink.toml");
        std::fs::write(&path, "host = \"h\"\nuser = \"u\"\npassword = \"p\"\n").unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.host, "h");

        let missing = SessionConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ExecError::ConfigError(_))));
    }

    #[test]
    fn test_connector_seeds_from_known_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "nas.lan ssh-ed25519 AAAAKEY\n").unwrap();

        let connector = SessionConfig::new("nas.lan", "u", Password::new("p"))
            .with_known_hosts(&path)
            .connector();

        assert_eq!(connector.known_hosts().len(), 1);
    }
}
