#![allow(unsafe_code)]

//! Advisory exclusive lock on the cache directory's `lock` file.
//!
//! The lock is byte-range based so a crashed holder releases it with
//! its file descriptors. Acquisition never blocks: a busy cache is a
//! hard open failure, not something to wait out.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Error, Result};

/// Held exclusive lock; dropping it unlocks.
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Creates the lock file if needed and takes the exclusive lock.
    /// Fails immediately with [`Error::Locked`] when another process
    /// holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        trace!(path = %path.display(), "locking file");
        match sys::lock_exclusive(&file) {
            Ok(true) => Ok(Self { file, path }),
            Ok(false) => Err(Error::Locked(parent_name(&path))),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "unlocking file");
        if let Err(err) = sys::unlock(&self.file) {
            tracing::warn!(%err, "unable to release the cache lock");
        }
    }
}

fn parent_name(path: &Path) -> String {
    path.parent()
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_exclusive(file: &File) -> io::Result<bool> {
        let mut flock = whole_file(libc::F_WRLCK);
        loop {
            let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let mut flock = whole_file(libc::F_UNLCK);
        let res = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn whole_file(kind: i32) -> libc::flock {
        libc::flock {
            l_type: kind as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_exclusive(file: &File) -> io::Result<bool> {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle() as _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            return Ok(false);
        }
        Err(err)
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let ok = unsafe {
            UnlockFileEx(
                file.as_raw_handle() as _,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
