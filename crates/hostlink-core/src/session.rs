//! `RemoteSession`: one SSH connection plus one file-copy channel
//!
//! The session owns a transport and a copy channel bound to it. Both are
//! opened together in [`RemoteSession::connect_with`] and released together
//! by [`RemoteSession::close`] or, failing that, when the session is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use hostlink_exec::{
    CommandStreams, ConnectionInfo, ExecError, FileCopyChannel, LocalFs, LoopbackTransport,
    RemoteCopy, RusshTransport, SftpFs, SshConnector, SshTransport,
};

use crate::config::SessionConfig;
use crate::logger::{LogRecord, SessionLogger, TracingLogger};

/// Source tag on every record this component logs
const LOG_SOURCE: &str = "RemoteSession";

/// Session over russh with an SFTP copy channel
pub type SshSession = RemoteSession<RusshTransport, RemoteCopy<SftpFs, RusshTransport>>;

/// Session over the loopback backend
pub type LoopbackSession =
    RemoteSession<LoopbackTransport, RemoteCopy<LocalFs, LoopbackTransport>>;

/// Connected remote host: transfer files and run commands
///
/// Not meant to be driven from several tasks at once.
pub struct RemoteSession<T: SshTransport, C: FileCopyChannel> {
    info: ConnectionInfo,
    transport: Option<T>,
    copy: Option<C>,
    logger: Arc<dyn SessionLogger>,
}

impl<T: SshTransport, C: FileCopyChannel> std::fmt::Debug for RemoteSession<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("info", &self.info)
            .field("transport", &self.transport_type())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Connect over SSH using `config`, logging through `tracing`
    ///
    /// # Errors
    /// Returns a connection-kind `ExecError` if the host cannot be reached,
    /// authentication fails, the host key is refused or SFTP is unavailable
    pub async fn connect(config: &SessionConfig) -> Result<Self, ExecError> {
        Self::connect_with(
            &config.connector(),
            config.connection_info(),
            Arc::new(TracingLogger),
        )
        .await
    }
}

impl<T: SshTransport, C: FileCopyChannel> RemoteSession<T, C> {
    /// Open a transport through `connector` and bind a copy channel to it
    ///
    /// If binding fails the transport is closed before the error is returned.
    ///
    /// # Errors
    /// Whatever the connector reports, unchanged
    #[instrument(skip(connector, info, logger), fields(host = %info.host, port = info.port))]
    pub async fn connect_with<K>(
        connector: &K,
        info: ConnectionInfo,
        logger: Arc<dyn SessionLogger>,
    ) -> Result<Self, ExecError>
    where
        K: SshConnector<Transport = T, Copy = C>,
    {
        let transport = connector.connect(&info).await?;
        debug!(transport = transport.transport_type(), "transport opened");

        let copy = match connector.bind_copy(&transport).await {
            Ok(copy) => copy,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    logger.log(LogRecord::warn(
                        LOG_SOURCE,
                        format!("failed to close transport to {}: {close_err}", info.host),
                    ));
                }
                return Err(e);
            }
        };

        logger.log(LogRecord::info(
            LOG_SOURCE,
            format!(
                "Connection with {} host on {} port has been successfully established",
                info.host, info.port
            ),
        ));

        Ok(Self {
            info,
            transport: Some(transport),
            copy: Some(copy),
            logger,
        })
    }

    /// Connection parameters
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Backend name of the open transport, `None` after close
    pub fn transport_type(&self) -> Option<&'static str> {
        self.transport.as_ref().map(|t| t.transport_type())
    }

    /// Whether the session still holds an open transport
    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Copy `remote_path` from the remote host into `local_path`
    ///
    /// `remote_path` may be a shell pattern; it is expanded by the remote
    /// shell. Directories need `recursive`.
    ///
    /// # Errors
    /// `ExecError::TransferFailed` for missing paths, permissions, dropped
    /// connections or a closed session. Partial files are left in place.
    pub async fn get(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<(), ExecError> {
        let copy = self.copy.as_ref().ok_or_else(closed_for_transfer)?;
        debug!(remote = %remote_path, local = %local_path.as_ref().display(), recursive, "get");
        copy.download(remote_path, local_path.as_ref(), recursive).await
    }

    /// [`RemoteSession::get`] into the current directory
    ///
    /// # Errors
    /// Same as [`RemoteSession::get`]
    pub async fn get_into_cwd(&self, remote_path: &str, recursive: bool) -> Result<(), ExecError> {
        self.get(remote_path, ".", recursive).await
    }

    /// Copy local paths, in order, to `remote_path`
    ///
    /// Pass a single path as `["file"]`. Several paths need `remote_path` to
    /// be an existing directory.
    ///
    /// # Errors
    /// `ExecError::InvalidArgument` if a directory is given without
    /// `recursive`, `ExecError::TransferFailed` otherwise
    pub async fn put<I, P>(
        &self,
        local_paths: I,
        remote_path: &str,
        recursive: bool,
    ) -> Result<(), ExecError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let copy = self.copy.as_ref().ok_or_else(closed_for_transfer)?;
        let locals: Vec<PathBuf> = local_paths
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();
        debug!(count = locals.len(), remote = %remote_path, recursive, "put");
        copy.upload(&locals, remote_path, recursive).await
    }

    /// Start `command` in the remote shell and return its streams
    ///
    /// Does not wait for the command. Opening the channel and every later
    /// read on stdout/stderr are bounded by `timeout`. See [`CommandStreams`]
    /// for why both output streams should be drained concurrently.
    ///
    /// # Errors
    /// `ExecError::ExecutionFailed` if no channel can be opened (including on
    /// a closed session), `ExecError::Timeout` if opening it stalls
    #[instrument(
        skip(self),
        fields(host = %self.info.host, transport = self.transport_type().unwrap_or("closed"))
    )]
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandStreams, ExecError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ExecError::ExecutionFailed("session is closed".to_string()))?;

        let streams = tokio::time::timeout(timeout, transport.open_exec(command))
            .await
            .map_err(|_| ExecError::Timeout { timeout })??;

        Ok(streams.with_timeout(timeout))
    }

    /// Close the copy channel, then the transport
    ///
    /// Never fails: errors are logged and dropped. Calling it again is a
    /// no-op, and later operations report a closed session.
    pub async fn close(&mut self) {
        let copy = self.copy.take();
        let transport = self.transport.take();
        if copy.is_none() && transport.is_none() {
            return;
        }

        if let Some(copy) = copy {
            if let Err(e) = copy.close().await {
                self.logger.log(LogRecord::warn(LOG_SOURCE, e.to_string()));
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                self.logger.log(LogRecord::warn(LOG_SOURCE, e.to_string()));
            }
        }

        self.log_closed();
    }

    fn log_closed(&self) {
        self.logger.log(LogRecord::info(
            LOG_SOURCE,
            format!("Connection with {} host has been closed", self.info.host),
        ));
    }
}

impl<T: SshTransport, C: FileCopyChannel> Drop for RemoteSession<T, C> {
    fn drop(&mut self) {
        // dropping the handles tears the connection down
        let copy = self.copy.take();
        let transport = self.transport.take();
        if copy.is_none() && transport.is_none() {
            return;
        }
        drop(copy);
        drop(transport);
        self.log_closed();
    }
}

fn closed_for_transfer() -> ExecError {
    ExecError::TransferFailed("session is closed".to_string())
}
