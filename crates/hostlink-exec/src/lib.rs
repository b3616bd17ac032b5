//! hostlink-exec: SSH transport and file-copy collaborators
//!
//! Provides the traits a remote session is built from, a russh/SFTP backend
//! and a loopback backend that serves a local directory.

pub mod copy;
pub mod error;
pub mod info;
pub mod known_hosts;
pub mod loopback;
pub mod sftp;
pub mod ssh;
pub mod stream;
pub mod traits;

pub use copy::{EntryKind, RemoteCopy, RemoteFs};
pub use error::{ErrorKind, ExecError};
pub use info::{ConnectionInfo, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT, Password};
pub use known_hosts::{HostKeyPolicy, HostKeyVerification, KnownHosts};
pub use loopback::{LocalFs, LoopbackConnector, LoopbackTransport};
pub use sftp::SftpFs;
pub use ssh::{RusshConnector, RusshTransport};
pub use stream::{CommandStreams, ExecStreams, ExitStatus, InputStream, OutputStream};
pub use traits::{FileCopyChannel, SshConnector, SshTransport};
