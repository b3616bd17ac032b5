//! hostlink-core: remote session facade
//!
//! Implements `RemoteSession` on top of the collaborators in `hostlink-exec`.
//! Contains session configuration and the lifecycle logger.

pub mod config;
pub mod logger;
pub mod session;

pub use config::SessionConfig;
pub use logger::{LogLevel, LogRecord, NullLogger, SessionLogger, TracingLogger};
pub use session::{LoopbackSession, RemoteSession, SshSession};

pub use hostlink_exec::{
    CommandStreams, ConnectionInfo, ErrorKind, ExecError, ExitStatus, HostKeyPolicy,
    InputStream, LoopbackConnector, OutputStream, Password,
};
