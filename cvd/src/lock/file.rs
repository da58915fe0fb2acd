//! Advisory `flock` on a single file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use cvd_shared::errors::{CvdError, CvdResult};

/// An exclusive lock on one file.
///
/// The lock is released when this guard is dropped, or when the process
/// exits/crashes.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Wait until the exclusive lock on `path` is granted.
    pub fn acquire(path: &Path) -> CvdResult<Self> {
        let file = open_lock_file(path)?;
        flock(&file, libc::LOCK_EX).map_err(|e| {
            CvdError::Io(format!("failed to lock {}: {e}", path.display()))
        })?;

        tracing::trace!(lock_path = %path.display(), "Acquired lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock without waiting; `None` when another holder has it.
    pub fn try_acquire(path: &Path) -> CvdResult<Option<Self>> {
        let file = open_lock_file(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                tracing::trace!(lock_path = %path.display(), "Lock is held elsewhere");
                return Ok(None);
            }
            Err(err) => {
                return Err(CvdError::Io(format!(
                    "failed to lock {}: {err}",
                    path.display()
                )));
            }
        }

        tracing::trace!(lock_path = %path.display(), "Acquired lock");
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Closing the descriptor would release it too
        let _ = flock(&self.file, libc::LOCK_UN);
        tracing::trace!(lock_path = %self.path.display(), "Released lock");
    }
}

fn open_lock_file(path: &Path) -> CvdResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            CvdError::Io(format!("failed to create lock dir {}: {e}", parent.display()))
        })?;
    }

    // Lock files in the host-wide directory are shared between users
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .mode(0o666)
        .open(path)
        .map_err(|e| CvdError::Io(format!("failed to open lock file {}: {e}", path.display())))
}

fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
