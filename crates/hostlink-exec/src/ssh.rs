//! SSH transport using russh crate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::ssh_key;
use russh::keys::ssh_key::HashAlg;
use russh::{Channel, ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::copy::RemoteCopy;
use crate::error::ExecError;
use crate::info::ConnectionInfo;
use crate::known_hosts::{HostKeyPolicy, HostKeyVerification, KnownHosts};
use crate::sftp::SftpFs;
use crate::stream::ExecStreams;
use crate::traits::{SshConnector, SshTransport};

/// Size of each stdin/stdout/stderr pipe between a channel and its caller
const PIPE_CAPACITY: usize = 64 * 1024;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHosts>,
    /// Why the host key was refused, read back after a failed connect
    rejection: Arc<Mutex<Option<String>>>,
}

impl SshClientHandler {
    fn reject(&self, reason: String) -> Result<bool, russh::Error> {
        warn!(host = %self.host, port = self.port, reason = %reason, "host key rejected");
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(reason);
        }
        Ok(false)
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        let encoded = match server_public_key.to_openssh() {
            Ok(encoded) => encoded,
            Err(e) => return self.reject(format!("cannot encode host key: {e}")),
        };
        let mut fields = encoded.split_whitespace();
        let (Some(key_type), Some(key_data)) = (fields.next(), fields.next()) else {
            return self.reject("malformed host key encoding".to_string());
        };

        match self
            .known_hosts
            .verify(&self.host, self.port, key_type, key_data)
        {
            HostKeyVerification::Verified => {
                debug!(host = %self.host, fingerprint = %fingerprint, "host key verified");
                Ok(true)
            }
            HostKeyVerification::Unknown => match self.policy {
                HostKeyPolicy::AutoAdd => {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        fingerprint = %fingerprint,
                        "trusting unknown host key"
                    );
                    self.known_hosts
                        .remember(&self.host, self.port, key_type, key_data);
                    Ok(true)
                }
                HostKeyPolicy::Reject => self.reject(format!("unknown host key {fingerprint}")),
            },
            HostKeyVerification::Changed => {
                self.reject(format!("host key changed, server presented {fingerprint}"))
            }
        }
    }
}

/// Error for a failed handshake, preferring a recorded host key rejection
fn connect_error(
    rejection: &Mutex<Option<String>>,
    info: &ConnectionInfo,
    err: impl std::fmt::Display,
) -> ExecError {
    let refused = rejection.lock().ok().and_then(|mut slot| slot.take());
    match refused {
        Some(reason) => ExecError::HostKeyRejected {
            host: info.address(),
            reason,
        },
        None => ExecError::ConnectionFailed(err.to_string()),
    }
}

/// Opens [`RusshTransport`]s and binds SFTP copy channels to them
#[derive(Debug, Clone)]
pub struct RusshConnector {
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHosts>,
}

impl RusshConnector {
    /// Create a connector with an explicit host key store
    #[must_use]
    pub fn new(policy: HostKeyPolicy, known_hosts: Arc<KnownHosts>) -> Self {
        Self {
            policy,
            known_hosts,
        }
    }

    /// Auto-add policy seeded from the user's `known_hosts`
    #[must_use]
    pub fn system() -> Self {
        Self::new(HostKeyPolicy::AutoAdd, Arc::new(KnownHosts::system()))
    }

    /// Host keys seen so far, shared by every connection from this connector
    #[must_use]
    pub fn known_hosts(&self) -> &Arc<KnownHosts> {
        &self.known_hosts
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    type Transport = RusshTransport;
    type Copy = RemoteCopy<SftpFs, RusshTransport>;

    #[instrument(skip(self, info), fields(host = %info.host, port = info.port))]
    async fn connect(&self, info: &ConnectionInfo) -> Result<RusshTransport, ExecError> {
        info!(
            host = %info.host,
            port = info.port,
            user = %info.user,
            "connecting to SSH"
        );

        let rejection = Arc::new(Mutex::new(None));
        let handler = SshClientHandler {
            host: info.host.clone(),
            port: info.port,
            policy: self.policy,
            known_hosts: Arc::clone(&self.known_hosts),
            rejection: Arc::clone(&rejection),
        };
        let config = Arc::new(client::Config::default());

        let establish = async {
            let mut session = client::connect(config, (&info.host[..], info.port), handler)
                .await
                .map_err(|e| connect_error(&rejection, info, e))?;

            let auth_res = session
                .authenticate_password(info.user.as_str(), info.password.expose())
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if !auth_res.success() {
                return Err(ExecError::AuthenticationFailed(format!(
                    "password rejected for user {}",
                    info.user
                )));
            }
            Ok::<_, ExecError>(session)
        };

        let session = timeout(info.connect_timeout, establish)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!(
                    "no answer from {} within {:?}",
                    info.address(),
                    info.connect_timeout
                ))
            })??;

        info!(host = %info.host, "SSH connected and authenticated");

        Ok(RusshTransport {
            inner: Arc::new(TransportInner {
                address: info.address(),
                session: Mutex::new(Some(Arc::new(session))),
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[instrument(skip(self, transport), fields(host = %transport.inner.address))]
    async fn bind_copy(&self, transport: &RusshTransport) -> Result<Self::Copy, ExecError> {
        let sftp = transport.open_sftp().await?;
        debug!("SFTP subsystem opened");
        Ok(RemoteCopy::new(SftpFs::new(sftp), transport.clone()))
    }
}

type SessionHandle = Arc<client::Handle<SshClientHandler>>;

struct TransportInner {
    address: String,
    session: Mutex<Option<SessionHandle>>,
    closed: AtomicBool,
}

/// Authenticated russh connection
///
/// Cheap to clone; clones share the connection. The connection ends on
/// [`SshTransport::close`] or when the last clone is dropped.
#[derive(Clone)]
pub struct RusshTransport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshTransport")
            .field("address", &self.inner.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RusshTransport {
    /// Shared handle to the connection, `None` once closed
    fn handle(&self) -> Option<SessionHandle> {
        self.inner.session.lock().ok().and_then(|slot| slot.clone())
    }

    async fn open_channel(&self) -> Result<Channel<Msg>, String> {
        // the lock is released before the open is awaited
        let session = self
            .handle()
            .ok_or_else(|| "transport is closed".to_string())?;
        session
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())
    }

    async fn open_sftp(&self) -> Result<SftpSession, ExecError> {
        let channel = self
            .open_channel()
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("cannot open SFTP channel: {e}")))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("SFTP subsystem refused: {e}")))?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("SFTP handshake failed: {e}")))
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    #[instrument(skip(self, command), fields(host = %self.inner.address))]
    async fn open_exec(&self, command: &str) -> Result<ExecStreams, ExecError> {
        if self.is_closed() {
            return Err(ExecError::ExecutionFailed(
                "transport is closed".to_string(),
            ));
        }

        debug!(command = %command, "opening exec channel");

        let mut channel = self
            .open_channel()
            .await
            .map_err(ExecError::ExecutionFailed)?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;

        let (stdin_caller, stdin_pump) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_pump, stdout_caller) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_pump, stderr_caller) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(pump_channel(
            channel,
            stdin_pump,
            stdout_pump,
            stderr_pump,
            exit_tx,
        ));

        Ok(ExecStreams {
            stdin: Box::new(stdin_caller),
            stdout: Box::new(stdout_caller),
            stderr: Box::new(stderr_caller),
            exit: exit_rx,
        })
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.inner.closed.store(true, Ordering::Release);

        let session = self
            .inner
            .session
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(session) = session {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;
            info!(host = %self.inner.address, "SSH disconnected");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self.handle().is_none_or(|session| session.is_closed())
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

/// Move bytes between one exec channel and the caller's pipes.
///
/// A single loop serves both output pipes, so a full stdout pipe also holds
/// back stderr (and the other way round) until the caller reads.
async fn pump_channel(
    mut channel: Channel<Msg>,
    mut stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    exit_tx: oneshot::Sender<i32>,
) {
    let mut exit_tx = Some(exit_tx);
    let mut buf = vec![0u8; PIPE_CAPACITY];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            read = stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) | Err(_) => {
                    stdin_open = false;
                    let _ = channel.eof().await;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        debug!(error = %e, "failed to forward stdin");
                        stdin_open = false;
                    }
                }
            },
            msg = channel.wait() => match msg {
                // a dropped reader must not stop the channel from draining
                Some(ChannelMsg::Data { data }) => {
                    let _ = stdout.write_all(&data).await;
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    let _ = stderr.write_all(&data).await;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(status = exit_status, "remote command exited");
                    if let Some(tx) = exit_tx.take() {
                        let _ = tx.send(exit_status.cast_signed());
                    }
                }
                Some(ChannelMsg::Eof) => {
                    let _ = stdout.shutdown().await;
                    let _ = stderr.shutdown().await;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    let _ = stdout.shutdown().await;
    let _ = stderr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use russh::client::Handler as _;

    use super::*;
    use crate::info::Password;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHZyN9VCJsWIZZg1wu432ULe+whI/MuDfB41UOyFKmw1";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMHcPfKWOGapZ3Xbt5oBumkeT05vMRMgTI7dy00TqrqR";

    fn handler_for(
        policy: HostKeyPolicy,
        known_hosts: &Arc<KnownHosts>,
        port: u16,
    ) -> SshClientHandler {
        SshClientHandler {
            host: "nas.lan".to_string(),
            port,
            policy,
            known_hosts: Arc::clone(known_hosts),
            rejection: Arc::new(Mutex::new(None)),
        }
    }

    fn public_key(line: &str) -> ssh_key::PublicKey {
        ssh_key::PublicKey::from_openssh(line).unwrap()
    }

    fn key_data(line: &str) -> &str {
        line.split_whitespace().nth(1).unwrap()
    }

    fn rejection(handler: &SshClientHandler) -> Option<String> {
        handler.rejection.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_auto_add_remembers_unknown_key() {
        let store = Arc::new(KnownHosts::new());
        let mut handler = handler_for(HostKeyPolicy::AutoAdd, &store, 2222);

        assert!(handler.check_server_key(&public_key(KEY_A)).await.unwrap());
        assert_eq!(rejection(&handler), None);
        assert_eq!(
            store.verify("nas.lan", 2222, "ssh-ed25519", key_data(KEY_A)),
            HostKeyVerification::Verified
        );

        // the remembered key now pins the host
        assert!(!handler.check_server_key(&public_key(KEY_B)).await.unwrap());
        assert!(rejection(&handler).unwrap().contains("changed"));
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_unknown_key() {
        let store = Arc::new(KnownHosts::new());
        let mut handler = handler_for(HostKeyPolicy::Reject, &store, 22);

        assert!(!handler.check_server_key(&public_key(KEY_A)).await.unwrap());
        assert!(rejection(&handler).unwrap().contains("unknown host key"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_known_key_accepted_under_reject() {
        let store = Arc::new(KnownHosts::parse(&format!("nas.lan {KEY_A}\n")));
        let mut handler = handler_for(HostKeyPolicy::Reject, &store, 22);

        assert!(handler.check_server_key(&public_key(KEY_A)).await.unwrap());
        assert_eq!(rejection(&handler), None);
    }

    #[tokio::test]
    async fn test_changed_key_refused_under_auto_add() {
        let store = Arc::new(KnownHosts::parse(&format!("nas.lan {KEY_A}\n")));
        let mut handler = handler_for(HostKeyPolicy::AutoAdd, &store, 22);

        assert!(!handler.check_server_key(&public_key(KEY_B)).await.unwrap());
        assert!(rejection(&handler).unwrap().contains("changed"));
        assert_eq!(
            store.verify("nas.lan", 22, "ssh-ed25519", key_data(KEY_B)),
            HostKeyVerification::Changed
        );
    }

    #[test]
    fn test_recorded_rejection_maps_to_host_key_error() {
        let info = ConnectionInfo::new("nas.lan", "backup", Password::new("x"));
        let slot = Mutex::new(Some("unknown host key SHA256:abc".to_string()));

        let err = connect_error(&slot, &info, "disconnected");
        assert!(matches!(
            err,
            ExecError::HostKeyRejected { ref reason, .. } if reason.contains("unknown host key")
        ));
        assert_eq!(slot.lock().unwrap().as_deref(), None);

        let err = connect_error(&slot, &info, "connection reset");
        assert!(matches!(err, ExecError::ConnectionFailed(ref m) if m == "connection reset"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // nothing listens on port 1 of the loopback interface
        let info = ConnectionInfo::new("127.0.0.1", "nobody", Password::new("x")).with_port(1);
        let connector = RusshConnector::new(HostKeyPolicy::AutoAdd, Arc::new(KnownHosts::new()));

        let err = connector.connect(&info).await.unwrap_err();
        assert!(matches!(err, ExecError::ConnectionFailed(_)));
    }

    // These tests require an SSH server - marked as ignored
    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_echo() {
        let info = ConnectionInfo::new("127.0.0.1", "root", Password::new("root"));
        let connector = RusshConnector::system();

        let transport = connector.connect(&info).await.unwrap();
        let mut streams = transport
            .open_exec("echo hello")
            .await
            .unwrap()
            .with_timeout(std::time::Duration::from_secs(5));

        assert_eq!(streams.stdout.read_string().await.unwrap(), "hello\n");
        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_concurrent_channel_opens() {
        let info = ConnectionInfo::new("127.0.0.1", "root", Password::new("root"));
        let transport = RusshConnector::system().connect(&info).await.unwrap();

        let (a, b) = tokio::join!(transport.open_exec("sleep 1"), transport.open_sftp());
        assert!(a.is_ok());
        assert!(b.is_ok());

        // a server-side disconnect shows up without calling close
        let streams = transport.open_exec("kill -HUP $PPID").await.unwrap();
        let _ = streams.with_timeout(std::time::Duration::from_secs(5)).exit.wait().await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert!(transport.is_closed());
    }
}
