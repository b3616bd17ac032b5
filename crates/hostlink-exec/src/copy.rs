//! Directory-aware file copy on top of a minimal remote filesystem
//!
//! Backends only provide [`RemoteFs`]; destination naming, recursion and
//! remote pattern expansion live here so every backend behaves like `scp`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::stream::{BoxedReader, BoxedWriter};
use crate::traits::{FileCopyChannel, SshTransport};

/// How long the remote shell gets to expand a path pattern
const EXPAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Characters that make the remote shell rewrite a path
const SHELL_PATTERN_CHARS: &[char] = &['*', '?', '[', '$', '~', '`'];

/// What a remote path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (or anything readable as one)
    File,
    /// Directory
    Dir,
}

/// Filesystem operations a copy backend has to provide
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Kind of `path`, `None` when it does not exist
    async fn stat(&self, path: &str) -> Result<Option<EntryKind>, ExecError>;

    /// Entries of a directory, without `.` and `..`
    async fn list_dir(&self, path: &str) -> Result<Vec<(String, EntryKind)>, ExecError>;

    /// Create a single directory
    async fn create_dir(&self, path: &str) -> Result<(), ExecError>;

    /// Open a file for reading
    async fn open_read(&self, path: &str) -> Result<BoxedReader, ExecError>;

    /// Create or truncate a file for writing
    async fn open_write(&self, path: &str) -> Result<BoxedWriter, ExecError>;

    /// Release backend resources
    async fn close(&self) -> Result<(), ExecError>;
}

/// [`FileCopyChannel`] over any [`RemoteFs`]
///
/// Keeps a handle to the transport it was bound to for expanding remote
/// patterns.
pub struct RemoteCopy<F, T> {
    fs: F,
    transport: T,
    closed: AtomicBool,
}

impl<F: RemoteFs, T: SshTransport> RemoteCopy<F, T> {
    /// Bind `fs` to `transport`
    pub fn new(fs: F, transport: T) -> Self {
        Self {
            fs,
            transport,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), ExecError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecError::TransferFailed(
                "copy channel is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Let the remote shell expand `pattern` into existing paths
    async fn expand(&self, pattern: &str) -> Result<Vec<String>, ExecError> {
        if !is_shell_pattern(pattern) {
            return Ok(vec![pattern.to_string()]);
        }

        let command =
            format!("for p in {pattern}; do [ -e \"$p\" ] && printf '%s\\n' \"$p\"; done; true");
        let mut streams = self
            .transport
            .open_exec(&command)
            .await
            .map_err(|e| ExecError::transfer(pattern, e))?
            .with_timeout(EXPAND_TIMEOUT);

        let (stdout, _) = tokio::join!(streams.stdout.read_string(), streams.stderr.read_all());
        let stdout = stdout.map_err(|e| ExecError::transfer(pattern, e))?;

        let matches: Vec<String> = stdout
            .lines()
            .filter(|line| !line.is_empty())
            // `.*` also matches the directory itself and its parent
            .filter(|line| !matches!(remote_basename(line), "." | ".."))
            .map(str::to_string)
            .collect();

        debug!(pattern = %pattern, matches = matches.len(), "expanded remote pattern");

        if matches.is_empty() {
            return Err(ExecError::TransferFailed(format!(
                "{pattern}: no such file or directory"
            )));
        }
        Ok(matches)
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ExecError> {
        let mut reader = self.fs.open_read(remote).await?;
        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| ExecError::transfer(local.display(), e))?;

        let bytes = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| ExecError::transfer(remote, e))?;
        file.flush()
            .await
            .map_err(|e| ExecError::transfer(local.display(), e))?;

        debug!(remote = %remote, local = %local.display(), bytes, "file downloaded");
        Ok(())
    }

    async fn download_tree(&self, remote: &str, local: &Path) -> Result<(), ExecError> {
        let mut pending = vec![(remote.to_string(), local.to_path_buf())];

        while let Some((remote_dir, local_dir)) = pending.pop() {
            tokio::fs::create_dir_all(&local_dir)
                .await
                .map_err(|e| ExecError::transfer(local_dir.display(), e))?;

            for (name, kind) in self.fs.list_dir(&remote_dir).await? {
                check_entry_name(&name)?;
                let remote_child = join_remote(&remote_dir, &name);
                let local_child = local_dir.join(&name);
                match kind {
                    EntryKind::File => self.download_file(&remote_child, &local_child).await?,
                    EntryKind::Dir => pending.push((remote_child, local_child)),
                }
            }
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| ExecError::transfer(local.display(), e))?;
        let mut writer = self.fs.open_write(remote).await?;

        let bytes = tokio::io::copy(&mut file, &mut writer)
            .await
            .map_err(|e| ExecError::transfer(remote, e))?;
        writer
            .shutdown()
            .await
            .map_err(|e| ExecError::transfer(remote, e))?;

        debug!(local = %local.display(), remote = %remote, bytes, "file uploaded");
        Ok(())
    }

    async fn upload_tree(&self, local: &Path, remote: &str) -> Result<(), ExecError> {
        let mut pending = vec![(local.to_path_buf(), remote.to_string())];

        while let Some((local_dir, remote_dir)) = pending.pop() {
            match self.fs.stat(&remote_dir).await? {
                None => self.fs.create_dir(&remote_dir).await?,
                Some(EntryKind::Dir) => {}
                Some(EntryKind::File) => {
                    return Err(ExecError::TransferFailed(format!(
                        "{remote_dir}: not a directory"
                    )));
                }
            }

            let mut entries = tokio::fs::read_dir(&local_dir)
                .await
                .map_err(|e| ExecError::transfer(local_dir.display(), e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ExecError::transfer(local_dir.display(), e))?
            {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let remote_child = join_remote(&remote_dir, &name);

                // follow symlinks like scp does
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| ExecError::transfer(path.display(), e))?;
                if meta.is_dir() {
                    pending.push((path, remote_child));
                } else {
                    self.upload_file(&path, &remote_child).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<F: RemoteFs, T: SshTransport> FileCopyChannel for RemoteCopy<F, T> {
    #[instrument(skip(self, local), fields(local = %local.display()))]
    async fn download(&self, remote: &str, local: &Path, recursive: bool) -> Result<(), ExecError> {
        self.ensure_open()?;

        let sources = self.expand(remote).await?;
        let local_is_dir = tokio::fs::metadata(local)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

        if sources.len() > 1 && !local_is_dir {
            return Err(ExecError::TransferFailed(format!(
                "{}: not a directory",
                local.display()
            )));
        }

        for source in &sources {
            check_entry_name(remote_basename(source))?;
        }

        for source in sources {
            let kind = self.fs.stat(&source).await?.ok_or_else(|| {
                ExecError::TransferFailed(format!("{source}: no such file or directory"))
            })?;

            let target = if local_is_dir {
                local.join(remote_basename(&source))
            } else {
                local.to_path_buf()
            };

            match kind {
                EntryKind::File => self.download_file(&source, &target).await?,
                EntryKind::Dir if !recursive => {
                    return Err(ExecError::TransferFailed(format!(
                        "{source}: not a regular file"
                    )));
                }
                EntryKind::Dir => self.download_tree(&source, &target).await?,
            }
        }
        Ok(())
    }

    #[instrument(skip(self, locals), fields(count = locals.len()))]
    async fn upload(
        &self,
        locals: &[PathBuf],
        remote: &str,
        recursive: bool,
    ) -> Result<(), ExecError> {
        self.ensure_open()?;

        if locals.is_empty() {
            return Err(ExecError::InvalidArgument(
                "no local paths given".to_string(),
            ));
        }

        // check every source before sending anything
        let mut sources = Vec::with_capacity(locals.len());
        for path in locals {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| ExecError::transfer(path.display(), e))?;
            if meta.is_dir() && !recursive {
                return Err(ExecError::InvalidArgument(format!(
                    "{}: is a directory and recursive is not set",
                    path.display()
                )));
            }
            sources.push((path, meta.is_dir()));
        }

        let remote_is_dir = self.fs.stat(remote).await? == Some(EntryKind::Dir);
        if sources.len() > 1 && !remote_is_dir {
            return Err(ExecError::TransferFailed(format!(
                "{remote}: not a directory"
            )));
        }

        for (path, is_dir) in sources {
            let target = if remote_is_dir {
                let name = local_basename(path)?;
                join_remote(remote, &name)
            } else {
                remote.to_string()
            };

            if is_dir {
                self.upload_tree(path, &target).await?;
            } else {
                self.upload_file(path, &target).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.fs.close().await
    }
}

/// Whether the remote shell would rewrite `path`
#[must_use]
pub fn is_shell_pattern(path: &str) -> bool {
    path.contains(SHELL_PATTERN_CHARS)
}

/// Join remote path segments with `/`
#[must_use]
pub fn join_remote(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Last component of a remote path
#[must_use]
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Refuse names that would place a download outside its destination
fn check_entry_name(name: &str) -> Result<(), ExecError> {
    if name.is_empty() || matches!(name, "." | "..") || name.contains(['/', '\\']) {
        return Err(ExecError::TransferFailed(format!("{name}: unexpected filename")));
    }
    Ok(())
}

fn local_basename(path: &Path) -> Result<String, ExecError> {
    if let Some(name) = path.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    // ".", ".." and friends: name the directory they resolve to
    std::fs::canonicalize(path)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| {
            ExecError::InvalidArgument(format!("{}: cannot derive a file name", path.display()))
        })
}
