//! Timeout-bounded filesystem probes.
//!
//! Stat, access and lock calls can hang on network mounts, so each one runs
//! on the blocking pool and is abandoned after the configured timeout.

use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{what} timed out after {}ms", .after.as_millis())]
    Timeout { what: String, after: Duration },

    #[error("{what} failed: {reason}")]
    Failed { what: String, reason: String },
}

/// Run a blocking probe with an upper bound on its duration.
pub async fn bounded<T, F>(what: &str, timeout: Duration, f: F) -> Result<T, ProbeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(ProbeError::Failed {
            what: what.to_string(),
            reason: join.to_string(),
        }),
        Err(_) => Err(ProbeError::Timeout {
            what: what.to_string(),
            after: timeout,
        }),
    }
}

/// Size of a regular file, `None` if missing or not a file.
pub fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Access mode for [`has_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Ask the OS whether the current process may read/write `path`.
#[cfg(unix)]
pub fn has_access(path: &Path, access: Access) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mode = match access {
        Access::Read => libc::R_OK,
        Access::Write => libc::W_OK,
    };
    unsafe { libc::access(c_path.as_ptr(), mode) == 0 }
}

#[cfg(not(unix))]
pub fn has_access(path: &Path, access: Access) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => match access {
            Access::Read => true,
            Access::Write => !meta.permissions().readonly(),
        },
        Err(_) => false,
    }
}

/// Lock state of an existing file as seen by an advisory exclusive lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held,
    Unknown,
}

/// Try to take and immediately release an exclusive lock on `path`.
pub fn lock_state(path: &Path) -> LockState {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return LockState::Unknown,
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            LockState::Free
        }
        Err(ref e) if is_contended(e) => LockState::Held,
        Err(_) => LockState::Unknown,
    }
}

/// Contention shows up as WouldBlock, or as raw EAGAIN/EWOULDBLOCK.
pub fn is_contended(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EAGAIN) || e.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return true;
    }
    false
}

/// Free bytes on the filesystem holding `path` (or its nearest ancestor).
pub fn available_space(path: &Path) -> io::Result<u64> {
    let target: PathBuf = super::pathutil::nearest_existing_ancestor(path)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
    fs2::available_space(&target)
}
