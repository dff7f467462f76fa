//! Pid-file based process supervision.
//!
//! `start` launches the current executable in `run` (foreground) mode,
//! detached from the shell, and records the child pid. Liveness is always
//! verified against the kernel (`kill(pid, 0)`), never trusted from the pid
//! file alone, so a stale file left by a crash does not block a restart.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("worker process already running (pid {0})")]
    AlreadyRunning(i32),
    #[error("worker process is not running")]
    NotRunning,
    #[error("another drayhorse command holds the command lock")]
    LockHeld,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running { pid: i32 },
    NotRunning,
}

pub struct Supervisor {
    state_dir: PathBuf,
}

impl Supervisor {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.state_dir.join("drayhorse.pid")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("drayhorse.lock")
    }

    pub fn status(&self) -> ProcessStatus {
        match self.read_live_pid() {
            Some(pid) => ProcessStatus::Running { pid },
            None => ProcessStatus::NotRunning,
        }
    }

    fn read_live_pid(&self) -> Option<i32> {
        let text = fs::read_to_string(self.pid_file()).ok()?;
        let pid: i32 = text.trim().parse().ok()?;
        process_alive(pid).then_some(pid)
    }

    /// Launch the worker process in the background.
    pub fn start(&self) -> Result<i32, DaemonError> {
        if let ProcessStatus::Running { pid } = self.status() {
            return Err(DaemonError::AlreadyRunning(pid));
        }

        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating state dir {}", self.state_dir.display()))?;

        let exe = std::env::current_exe().context("resolving current executable")?;
        let child = Command::new(exe)
            .arg("--state-dir")
            .arg(&self.state_dir)
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning worker process")?;

        let pid = child.id() as i32;
        fs::write(self.pid_file(), pid.to_string()).context("writing pid file")?;
        info!(pid, "worker process started");
        Ok(pid)
    }

    /// Graceful stop: SIGTERM, then wait for the process to drain and exit.
    /// The process is never SIGKILLed; a hung worker surfaces as a timeout
    /// error for the operator.
    pub fn stop(&self, wait: Duration) -> Result<(), DaemonError> {
        let pid = self.read_live_pid().ok_or(DaemonError::NotRunning)?;

        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(anyhow::Error::from(err)
                    .context(format!("signalling pid {pid}"))
                    .into());
            }
        }

        let deadline = Instant::now() + wait;
        while process_alive(pid) {
            if Instant::now() >= deadline {
                return Err(anyhow::anyhow!(
                    "worker process {pid} did not exit within {}s",
                    wait.as_secs()
                )
                .into());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        let _ = fs::remove_file(self.pid_file());
        info!(pid, "worker process stopped");
        Ok(())
    }

    /// Stop the worker if it is running, then start a fresh one.
    pub fn restart(&self, wait: Duration) -> Result<i32, DaemonError> {
        match self.stop(wait) {
            Ok(()) | Err(DaemonError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        self.start()
    }
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
