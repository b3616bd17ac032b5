//! Collaborator traits a `RemoteSession` is built from

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ExecError;
use crate::info::ConnectionInfo;
use crate::stream::ExecStreams;

/// An authenticated connection that can start commands
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a new exec channel and start `command` in the remote shell
    ///
    /// Does not wait for the command to finish.
    async fn open_exec(&self, command: &str) -> Result<ExecStreams, ExecError>;

    /// Close the connection. Channels opened from it stop working.
    async fn close(&self) -> Result<(), ExecError>;

    /// Whether `close` has been called or the peer went away
    fn is_closed(&self) -> bool;

    /// Short backend name for logs
    fn transport_type(&self) -> &'static str;
}

/// File transfer bound to one transport
#[async_trait]
pub trait FileCopyChannel: Send + Sync {
    /// Copy `remote` (path or remote shell pattern) into `local`
    async fn download(&self, remote: &str, local: &Path, recursive: bool) -> Result<(), ExecError>;

    /// Copy every entry of `locals`, in order, to `remote`
    async fn upload(&self, locals: &[PathBuf], remote: &str, recursive: bool)
    -> Result<(), ExecError>;

    /// Release the channel
    async fn close(&self) -> Result<(), ExecError>;
}

/// Opens transports and binds copy channels to them
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Transport produced by [`SshConnector::connect`]
    type Transport: SshTransport;
    /// Copy channel produced by [`SshConnector::bind_copy`]
    type Copy: FileCopyChannel;

    /// Connect and authenticate
    async fn connect(&self, info: &ConnectionInfo) -> Result<Self::Transport, ExecError>;

    /// Bind a copy channel to an established transport
    async fn bind_copy(&self, transport: &Self::Transport) -> Result<Self::Copy, ExecError>;
}
