//! Loopback backend: a local directory stands in for the remote host
//!
//! Commands run under `sh -c` with the directory as working directory and
//! transfers go through the same copy engine as SFTP. Useful for tests and
//! dry runs without an SSH server.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, instrument};

use crate::copy::{EntryKind, RemoteCopy, RemoteFs};
use crate::error::ExecError;
use crate::info::{ConnectionInfo, Password};
use crate::stream::{BoxedReader, BoxedWriter, ExecStreams};
use crate::traits::{SshConnector, SshTransport};

/// Connector for the loopback backend
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    root: PathBuf,
    credentials: Option<(String, Password)>,
}

impl LoopbackConnector {
    /// Serve `root` as the remote filesystem, accepting any credentials
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            credentials: None,
        }
    }

    /// Only accept `user` with `password`
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: Password) -> Self {
        self.credentials = Some((user.into(), password));
        self
    }

    /// Directory standing in for the remote host
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SshConnector for LoopbackConnector {
    type Transport = LoopbackTransport;
    type Copy = RemoteCopy<LocalFs, LoopbackTransport>;

    #[instrument(skip(self, info), fields(host = %info.host))]
    async fn connect(&self, info: &ConnectionInfo) -> Result<LoopbackTransport, ExecError> {
        if let Some((user, password)) = &self.credentials {
            if user != &info.user || password != &info.password {
                return Err(ExecError::AuthenticationFailed(format!(
                    "password rejected for user {}",
                    info.user
                )));
            }
        }

        let is_dir = tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(ExecError::ConnectionFailed(format!(
                "{}: loopback root is not a directory",
                self.root.display()
            )));
        }

        debug!(root = %self.root.display(), "loopback transport opened");

        Ok(LoopbackTransport {
            inner: Arc::new(LoopbackInner {
                root: self.root.clone(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn bind_copy(&self, transport: &LoopbackTransport) -> Result<Self::Copy, ExecError> {
        if transport.is_closed() {
            return Err(ExecError::ConnectionFailed(
                "transport is closed".to_string(),
            ));
        }
        let fs = LocalFs {
            root: transport.inner.root.clone(),
        };
        Ok(RemoteCopy::new(fs, transport.clone()))
    }
}

#[derive(Debug)]
struct LoopbackInner {
    root: PathBuf,
    closed: AtomicBool,
}

/// Transport that runs commands locally
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

#[async_trait]
impl SshTransport for LoopbackTransport {
    #[instrument(skip(self), level = "debug")]
    async fn open_exec(&self, command: &str) -> Result<ExecStreams, ExecError> {
        if self.is_closed() {
            return Err(ExecError::ExecutionFailed(
                "transport is closed".to_string(),
            ));
        }

        debug!(command = %command, "executing loopback command");

        // Use shell to support pipes, redirections, etc.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.inner.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ExecError::ExecutionFailed(
                "child process pipes unavailable".to_string(),
            ));
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(status.code().unwrap_or(-1));
                }
                Err(e) => debug!(error = %e, "failed to wait for loopback command"),
            }
        });

        Ok(ExecStreams {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: exit_rx,
        })
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn transport_type(&self) -> &'static str {
        "loopback"
    }
}

/// [`RemoteFs`] over the local filesystem, relative paths resolve against the root
#[derive(Debug)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn stat(&self, path: &str) -> Result<Option<EntryKind>, ExecError> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Dir)),
            Ok(_) => Ok(Some(EntryKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExecError::transfer(path, e)),
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<(String, EntryKind)>, ExecError> {
        let mut entries = tokio::fs::read_dir(self.resolve(path))
            .await
            .map_err(|e| ExecError::transfer(path, e))?;

        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ExecError::transfer(path, e))?
        {
            let meta = tokio::fs::metadata(entry.path())
                .await
                .map_err(|e| ExecError::transfer(path, e))?;
            let kind = if meta.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            listing.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        Ok(listing)
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecError> {
        tokio::fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| ExecError::transfer(path, e))
    }

    async fn open_read(&self, path: &str) -> Result<BoxedReader, ExecError> {
        let file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| ExecError::transfer(path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, ExecError> {
        let file = tokio::fs::File::create(self.resolve(path))
            .await
            .map_err(|e| ExecError::transfer(path, e))?;
        Ok(Box::new(file))
    }

    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }
}
