//! Standard stream handles for a started remote command

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::error::ExecError;

/// Boxed reader handed out by transports
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer handed out by transports
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw handles returned by [`crate::traits::SshTransport::open_exec`]
pub struct ExecStreams {
    /// Writes to the command's standard input
    pub stdin: BoxedWriter,
    /// Command's standard output
    pub stdout: BoxedReader,
    /// Command's standard error
    pub stderr: BoxedReader,
    /// Resolves once the remote side reports an exit status
    pub exit: oneshot::Receiver<i32>,
}

impl ExecStreams {
    /// Attach a read timeout to every handle
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> CommandStreams {
        CommandStreams {
            stdin: InputStream { inner: self.stdin },
            stdout: OutputStream::new(self.stdout, timeout),
            stderr: OutputStream::new(self.stderr, timeout),
            exit: ExitStatus {
                rx: self.exit,
                timeout,
            },
        }
    }
}

/// Handles for a running command.
///
/// stdout and stderr are independent. Backends feed them through bounded
/// buffers, so a command that writes a lot to one stream while the caller
/// only reads the other can stall both. Drain them concurrently (for example
/// with `tokio::join!`) when the output size is not known to be small.
pub struct CommandStreams {
    /// Command input
    pub stdin: InputStream,
    /// Command output
    pub stdout: OutputStream,
    /// Command error output
    pub stderr: OutputStream,
    /// Exit status of the command
    pub exit: ExitStatus,
}

/// Writer connected to the command's standard input.
///
/// Dropping it or calling [`InputStream::close`] sends EOF.
pub struct InputStream {
    inner: BoxedWriter,
}

impl InputStream {
    /// Write all of `data` and flush
    ///
    /// # Errors
    /// Returns `ExecError::ExecutionFailed` if the channel is gone
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| ExecError::ExecutionFailed(e.to_string()))
    }

    /// Signal EOF to the command
    ///
    /// # Errors
    /// Returns `ExecError::ExecutionFailed` if the channel is gone
    pub async fn close(mut self) -> Result<(), ExecError> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| ExecError::ExecutionFailed(e.to_string()))
    }
}

impl AsyncWrite for InputStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reader for stdout or stderr that fails when the channel goes quiet.
///
/// A read that sees no data for `timeout` returns an `io::Error` of kind
/// `TimedOut` (or `ExecError::Timeout` from the helper methods). The timer
/// restarts after every successful read.
pub struct OutputStream {
    inner: BoxedReader,
    timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl OutputStream {
    fn new(inner: BoxedReader, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: None,
        }
    }

    /// Read until EOF
    ///
    /// # Errors
    /// `ExecError::Timeout` if the stream stalls, `ExecError::ExecutionFailed`
    /// for any other channel failure
    pub async fn read_all(&mut self) -> Result<Vec<u8>, ExecError> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)
            .await
            .map_err(|e| self.map_io(&e))?;
        Ok(buf)
    }

    /// Read until EOF, decoding lossily as UTF-8
    ///
    /// # Errors
    /// Same as [`OutputStream::read_all`]
    pub async fn read_string(&mut self) -> Result<String, ExecError> {
        let bytes = self.read_all().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read whatever is available, waiting at most the timeout
    ///
    /// Returns 0 at EOF.
    ///
    /// # Errors
    /// Same as [`OutputStream::read_all`]
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ExecError> {
        self.read(buf).await.map_err(|e| self.map_io(&e))
    }

    fn map_io(&self, err: &io::Error) -> ExecError {
        if err.kind() == io::ErrorKind::TimedOut {
            ExecError::Timeout {
                timeout: self.timeout,
            }
        } else {
            ExecError::ExecutionFailed(err.to_string())
        }
    }
}

impl AsyncRead for OutputStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            this.deadline = None;
            return Poll::Ready(res);
        }

        let timeout = this.timeout;
        let deadline = this
            .deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.deadline = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no channel activity for {timeout:?}"),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Pending exit status of a command
pub struct ExitStatus {
    rx: oneshot::Receiver<i32>,
    timeout: Duration,
}

impl ExitStatus {
    /// Wait for the exit status, bounded by the command timeout
    ///
    /// # Errors
    /// `ExecError::Timeout` if no status arrives in time,
    /// `ExecError::ExecutionFailed` if the channel closed without one
    pub async fn wait(self) -> Result<i32, ExecError> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(ExecError::ExecutionFailed(
                "channel closed without exit status".to_string(),
            )),
            Err(_) => Err(ExecError::Timeout {
                timeout: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streams_from(
        stdout: impl AsyncRead + Send + Unpin + 'static,
        timeout: Duration,
    ) -> (CommandStreams, oneshot::Sender<i32>) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let streams = ExecStreams {
            stdin: Box::new(tokio::io::sink()),
            stdout: Box::new(stdout),
            stderr: Box::new(tokio::io::empty()),
            exit: exit_rx,
        };
        (streams.with_timeout(timeout), exit_tx)
    }

    #[tokio::test]
    async fn test_read_string_until_eof() {
        let (mut streams, _exit) = streams_from(&b"hello\n"[..], Duration::from_secs(1));

        assert_eq!(streams.stdout.read_string().await.unwrap(), "hello\n");
        assert_eq!(streams.stderr.read_string().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_stalled_read_times_out() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (mut streams, _exit) = streams_from(reader, Duration::from_millis(50));

        let result = streams.stdout.read_string().await;
        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_activity_restarts_timer() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (mut streams, _exit) = streams_from(reader, Duration::from_millis(200));

        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                writer.write_all(b"tick\n").await.unwrap();
            }
        });

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let n = streams.stdout.read_chunk(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"tick\n");
        }
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_status() {
        let (streams, exit_tx) = streams_from(tokio::io::empty(), Duration::from_secs(1));
        exit_tx.send(3).unwrap();

        assert_eq!(streams.exit.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exit_status_missing() {
        let (streams, exit_tx) = streams_from(tokio::io::empty(), Duration::from_secs(1));
        drop(exit_tx);

        assert!(matches!(
            streams.exit.wait().await,
            Err(ExecError::ExecutionFailed(_))
        ));
    }
}
