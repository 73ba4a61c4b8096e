use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::process::{Child, Command};

use crate::naming::DayKey;
use crate::Result;

/// Everything a command factory needs to know about the run it is building.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub day_key: DayKey,
    pub started_at: OffsetDateTime,
    /// 1-based launch counter across the supervisor's lifetime.
    pub launch: u32,
}

/// Builds the external capture command for one run.
///
/// Called once per launch with the day key at launch time, so output naming
/// reflects the day the process started rather than the day a file is
/// written.
pub trait CaptureCommand: Send + Sync {
    fn build(&self, ctx: &LaunchContext) -> Result<Command>;
}

/// How a capture run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Clean,
    Code(i32),
    Signal(i32),
    /// The process could not be started at all.
    LaunchFailed,
}

impl ExitKind {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitKind::Clean,
            Some(code) => ExitKind::Code(code),
            None => signal_of(status),
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, ExitKind::Clean)
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> ExitKind {
    use std::os::unix::process::ExitStatusExt;
    ExitKind::Signal(status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> ExitKind {
    ExitKind::Signal(0)
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "exit code 0"),
            ExitKind::Code(code) => write!(f, "exit code {code}"),
            ExitKind::Signal(sig) => write!(f, "signal {sig}"),
            ExitKind::LaunchFailed => write!(f, "launch failure"),
        }
    }
}

/// One run of the capture process. Exactly one is active per supervisor.
#[derive(Debug)]
pub struct CaptureProcessHandle {
    pub pid: Option<u32>,
    pub started_at: OffsetDateTime,
    pub day_key: DayKey,
    pub exit: Option<ExitKind>,
    child: Child,
}

impl CaptureProcessHandle {
    /// Spawns `command` with stderr captured for log streaming.
    pub fn spawn(mut command: Command, ctx: &LaunchContext) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        Ok(Self {
            pid: child.id(),
            started_at: ctx.started_at,
            day_key: ctx.day_key,
            exit: None,
            child,
        })
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub fn record_exit(&mut self, status: ExitStatus) -> ExitKind {
        let kind = ExitKind::from_status(status);
        self.exit = Some(kind);
        kind
    }

    /// Asks the process to exit, waits up to `grace`, then kills it.
    ///
    /// Returns the exit and whether the grace period ran out.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<(ExitKind, bool)> {
        if let Some(kind) = self.exit {
            return Ok((kind, false));
        }
        if let Some(status) = self.child.try_wait()? {
            return Ok((self.record_exit(status), false));
        }

        request_graceful_stop(&mut self.child);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok((self.record_exit(status?), false)),
            Err(_) => {
                self.child.start_kill()?;
                let status = self.child.wait().await?;
                Ok((self.record_exit(status), true))
            }
        }
    }
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: the pid belongs to a child we have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            log::debug!(
                "SIGTERM to pid {pid} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child) {
    let _ = child.start_kill();
}
