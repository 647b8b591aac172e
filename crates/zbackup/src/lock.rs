//! Single-instance run lock.
//!
//! A PID file created exclusively at the configured path. A live owner means
//! another run is in progress; a dead owner or unreadable contents mark the
//! file stale, in which case it is removed and acquisition retried once.
//! The file is removed when the [`RunLock`] is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Which file operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOperation {
    /// Creating the PID file.
    Create,
    /// Reading an existing PID file.
    Read,
    /// Writing our PID.
    Write,
    /// Removing a stale PID file.
    Remove,
}

/// Errors raised while taking the run lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock path is a symlink.
    #[error("run lock path is a symlink: {path:?}")]
    Symlink {
        /// Offending path.
        path: PathBuf,
    },
    /// The file reappeared after a stale lock was removed.
    #[error("run lock at {path:?} was taken over by another process")]
    Contended {
        /// Lock path.
        path: PathBuf,
    },
    /// Filesystem error.
    #[error("io error while {operation:?} {path:?}: {source}")]
    Io {
        /// Lock path.
        path: PathBuf,
        /// What was attempted.
        operation: LockOperation,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result of trying to take the lock.
#[derive(Debug)]
pub enum LockOutcome {
    /// The lock is ours until the guard drops.
    Acquired(RunLock),
    /// Another live process holds it.
    Held {
        /// Owner PID.
        pid: u32,
    },
}

/// Guard for the PID file.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl RunLock {
    /// Take the lock at `path`.
    pub fn acquire(path: &Path) -> Result<LockOutcome, LockError> {
        reject_symlink(path)?;
        if let Some(lock) = Self::try_create(path)? {
            return Ok(LockOutcome::Acquired(lock));
        }

        match read_owner(path)? {
            Some(pid) if pid_is_alive(pid) => return Ok(LockOutcome::Held { pid }),
            Some(pid) => warn!(pid, "removing stale run lock {}", path.display()),
            None => warn!("removing unreadable run lock {}", path.display()),
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    operation: LockOperation::Remove,
                    source,
                })
            }
        }

        match Self::try_create(path)? {
            Some(lock) => Ok(LockOutcome::Acquired(lock)),
            None => match read_owner(path)? {
                Some(pid) if pid_is_alive(pid) => Ok(LockOutcome::Held { pid }),
                _ => Err(LockError::Contended {
                    path: path.to_path_buf(),
                }),
            },
        }
    }

    fn try_create(path: &Path) -> Result<Option<Self>, LockError> {
        let mut file = match open_new_lock_file(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    operation: LockOperation::Create,
                    source,
                })
            }
        };
        let pid = std::process::id();
        let lock = Self {
            path: path.to_path_buf(),
            pid,
            released: false,
        };
        writeln!(file, "{}", pid)
            .and_then(|_| file.sync_all())
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                operation: LockOperation::Write,
                source,
            })?;
        debug!(pid, "acquired run lock {}", path.display());
        Ok(Some(lock))
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID written to the lock file.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Remove the lock file now.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            operation: LockOperation::Remove,
            source,
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn open_new_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options.open(path)
}

fn reject_symlink(path: &Path) -> Result<(), LockError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LockError::Symlink {
            path: path.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

/// Owner PID recorded in `path`; `None` when the contents are not a PID.
fn read_owner(path: &Path) -> Result<Option<u32>, LockError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            operation: LockOperation::Read,
            source,
        }),
    }
}

/// Whether a process with `pid` exists. EPERM means it exists under another user.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(raw, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
