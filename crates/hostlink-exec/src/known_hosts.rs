//! Host key store and verification policy

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do with a host key that is not in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Trust and remember unknown keys (trust on first use)
    #[default]
    AutoAdd,
    /// Refuse hosts that are not already known
    Reject,
}

/// Outcome of looking a key up in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry
    Verified,
    /// Nothing stored for this host and key type
    Unknown,
    /// A different key of the same type is stored
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory view of a `known_hosts` file
///
/// Keys accepted under [`HostKeyPolicy::AutoAdd`] are only remembered here,
/// the file on disk is never rewritten.
#[derive(Debug, Default)]
pub struct KnownHosts {
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
}

impl KnownHosts {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default `known_hosts` location of the current user
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
    }

    /// Load the user's `known_hosts`, falling back to an empty store
    #[must_use]
    pub fn system() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_or_empty(&path),
            None => Self::new(),
        }
    }

    /// Load `path`, falling back to an empty store when it cannot be read
    #[must_use]
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => store,
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "failed to load known_hosts");
                } else {
                    debug!(path = %path.display(), "known_hosts not found");
                }
                Self::new()
            }
        }
    }

    /// Parse a `known_hosts` file
    ///
    /// # Errors
    /// Returns the I/O error if the file cannot be read
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::parse(&content);
        debug!(path = %path.display(), hosts = store.len(), "loaded known_hosts");
        Ok(store)
    }

    /// Parse `known_hosts` content. Hashed names and marker lines are skipped.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(names), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            for name in names.split(',') {
                if name.starts_with('|') {
                    continue;
                }
                hosts.entry(name.to_lowercase()).or_default().push(HostKeyEntry {
                    key_type: key_type.to_string(),
                    key_data: key_data.to_string(),
                });
            }
        }

        Self {
            hosts: RwLock::new(hosts),
        }
    }

    /// Number of distinct host names with at least one key
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key_type`/`key_data` (base64) for `host:port`
    #[must_use]
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_data: &str,
    ) -> HostKeyVerification {
        let Ok(hosts) = self.hosts.read() else {
            return HostKeyVerification::Unknown;
        };

        let Some(entries) = hosts.get(&lookup_key(host, port)) else {
            return HostKeyVerification::Unknown;
        };

        let mut same_type = entries.iter().filter(|e| e.key_type == key_type).peekable();
        if same_type.peek().is_none() {
            return HostKeyVerification::Unknown;
        }
        if same_type.any(|e| e.key_data == key_data) {
            HostKeyVerification::Verified
        } else {
            HostKeyVerification::Changed
        }
    }

    /// Remember a key for `host:port`
    pub fn remember(&self, host: &str, port: u16, key_type: &str, key_data: &str) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.entry(lookup_key(host, port)).or_default().push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_data.to_string(),
            });
        }
    }
}

/// `known_hosts` host field: bare name on 22, `[name]:port` otherwise
fn lookup_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{host}]:{port}")
    }
}
