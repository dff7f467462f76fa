//! Command serialization via an flock'd lockfile.
//!
//! State-changing CLI commands (start/stop/restart/watch) take this lock so
//! two concurrent invocations, e.g. an operator and the cron watcher, cannot
//! interleave. The lock is advisory and per-fd, released on drop or process
//! exit.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

pub struct CommandLock {
    _file: File,
}

impl CommandLock {
    /// Try to take the lock without blocking. `Ok(None)` means another
    /// command currently holds it.
    pub fn acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(Self { _file: file }));
        }

        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(None)
        } else {
            Err(err)
        }
    }
}
