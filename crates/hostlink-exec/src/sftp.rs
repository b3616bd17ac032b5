//! SFTP-backed remote filesystem for file transfers

use async_trait::async_trait;
use russh_sftp::client::SftpSession;

use crate::copy::{EntryKind, RemoteFs};
use crate::error::ExecError;
use crate::stream::{BoxedReader, BoxedWriter};

/// [`RemoteFs`] over an SFTP subsystem channel
pub struct SftpFs {
    session: SftpSession,
}

impl SftpFs {
    /// Wrap an established SFTP session
    #[must_use]
    pub fn new(session: SftpSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl RemoteFs for SftpFs {
    async fn stat(&self, path: &str) -> Result<Option<EntryKind>, ExecError> {
        let exists = self
            .session
            .try_exists(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))?;
        if !exists {
            return Ok(None);
        }

        let metadata = self
            .session
            .metadata(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))?;

        Ok(Some(if metadata.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        }))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<(String, EntryKind)>, ExecError> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    return None;
                }
                let kind = if entry.metadata().is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                };
                Some((name, kind))
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), ExecError> {
        self.session
            .create_dir(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))
    }

    async fn open_read(&self, path: &str) -> Result<BoxedReader, ExecError> {
        let file = self
            .session
            .open(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &str) -> Result<BoxedWriter, ExecError> {
        let file = self
            .session
            .create(path)
            .await
            .map_err(|e| ExecError::transfer(path, e))?;
        Ok(Box::new(file))
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.session
            .close()
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("SFTP close failed: {e}")))
    }
}
