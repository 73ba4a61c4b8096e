//! Supervision of the external capture process.
//!
//! The supervisor keeps exactly one capture process alive. It relaunches it
//! when the calendar day changes so no segment carries a stale day label,
//! retries failed runs with exponential backoff, and tears the process down
//! (SIGTERM, grace period, SIGKILL) when cancelled.
//!
//! ```text
//! Idle -> Launching -> Streaming -> Rotating -> Launching
//!                              \-> Retrying -> Launching
//!                              \-> Stopping -> Stopped
//! ```

mod backoff;
mod ffmpeg;
mod observer;
mod process;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::ChildStderr;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};

pub use backoff::{Backoff, RetryPolicy};
pub use ffmpeg::{AudioMode, CaptureConfig, FfmpegCommand};
pub use observer::{
    annotate_line, LineHint, LogObserver, NotifyOnExit, SupervisorEvent, SupervisorObserver,
};
pub use process::{CaptureCommand, CaptureProcessHandle, ExitKind, LaunchContext};

/// How long to keep reading stderr after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,

    /// How often the wall-clock day is compared with the running process.
    #[serde(with = "crate::config::secs")]
    pub day_poll_interval: Duration,

    /// Time allowed between SIGTERM and SIGKILL.
    #[serde(with = "crate::config::secs")]
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            day_poll_interval: Duration::from_secs(15),
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Streaming,
    Rotating,
    Retrying,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The capture process exited with status 0.
    CleanExit,
    /// The cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub reason: StopReason,
    pub launches: u32,
    pub retries: u32,
    pub rotations: u32,
}

enum RunEnd {
    Exited(ExitKind),
    Rotate,
    Cancelled,
}

pub struct Supervisor {
    command: Arc<dyn CaptureCommand>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SupervisorObserver>,
    config: SupervisorConfig,
    state: SupervisorState,
}

impl Supervisor {
    pub fn new(command: Arc<dyn CaptureCommand>, config: SupervisorConfig) -> Self {
        Self {
            command,
            clock: Arc::new(SystemClock::default()),
            observer: Arc::new(LogObserver),
            config,
            state: SupervisorState::Idle,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SupervisorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Runs capture until `cancel` fires, the process exits cleanly, or the
    /// retry budget runs out (reported as [`Error::RetriesExhausted`]).
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<SupervisorReport> {
        let mut backoff = self.config.retry.backoff();
        let mut launches = 0u32;
        let mut rotations = 0u32;

        let report = |reason, launches, backoff: &Backoff, rotations| SupervisorReport {
            reason,
            launches,
            retries: backoff.retries(),
            rotations,
        };

        loop {
            if cancel.is_cancelled() {
                self.set_state(SupervisorState::Stopped);
                return Ok(report(StopReason::Cancelled, launches, &backoff, rotations));
            }

            self.set_state(SupervisorState::Launching);
            launches += 1;
            let ctx = LaunchContext {
                day_key: self.clock.day_key(),
                started_at: self.clock.now(),
                launch: launches,
            };

            let exit = match self.launch(&ctx) {
                Ok(mut handle) => {
                    self.emit(SupervisorEvent::Launched {
                        pid: handle.pid,
                        day_key: handle.day_key,
                        launch: launches,
                    });
                    self.set_state(SupervisorState::Streaming);
                    match self.stream(&mut handle, cancel).await {
                        RunEnd::Exited(exit) => {
                            self.emit(SupervisorEvent::Exited { exit });
                            exit
                        }
                        RunEnd::Rotate => {
                            rotations += 1;
                            continue;
                        }
                        RunEnd::Cancelled => {
                            self.set_state(SupervisorState::Stopped);
                            return Ok(report(StopReason::Cancelled, launches, &backoff, rotations));
                        }
                    }
                }
                Err(err) => {
                    self.emit(SupervisorEvent::LaunchFailed {
                        reason: err.to_string(),
                    });
                    ExitKind::LaunchFailed
                }
            };

            if exit.is_clean() {
                self.set_state(SupervisorState::Stopped);
                return Ok(report(StopReason::CleanExit, launches, &backoff, rotations));
            }

            self.set_state(SupervisorState::Retrying);
            let Some(delay) = backoff.next_delay() else {
                let retries = backoff.retries();
                self.emit(SupervisorEvent::RetriesExhausted { retries });
                self.set_state(SupervisorState::Stopped);
                return Err(Error::RetriesExhausted {
                    attempts: retries,
                    last_exit: exit,
                });
            };
            self.emit(SupervisorEvent::RetryScheduled {
                retry: backoff.retries(),
                delay,
            });
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(SupervisorState::Stopped);
                    return Ok(report(StopReason::Cancelled, launches, &backoff, rotations));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn launch(&self, ctx: &LaunchContext) -> Result<CaptureProcessHandle> {
        let command = self.command.build(ctx)?;
        CaptureProcessHandle::spawn(command, ctx).map_err(|err| Error::Launch(err.to_string()))
    }

    async fn stream(&mut self, handle: &mut CaptureProcessHandle, cancel: &CancellationToken) -> RunEnd {
        let mut lines = handle
            .child_mut()
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines());

        let period = self.config.day_poll_interval.max(Duration::from_millis(1));
        let mut day_ticker = tokio::time::interval(period);
        day_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        day_ticker.tick().await;

        loop {
            tokio::select! {
                line = next_line(&mut lines), if lines.is_some() => match line {
                    Ok(Some(line)) => self.forward_line(&line),
                    Ok(None) => lines = None,
                    Err(err) => {
                        log::debug!("capture stderr closed: {err}");
                        lines = None;
                    }
                },
                status = handle.child_mut().wait() => {
                    if let Some(lines) = lines.as_mut() {
                        self.drain(lines).await;
                    }
                    return match status {
                        Ok(status) => RunEnd::Exited(handle.record_exit(status)),
                        Err(err) => {
                            log::error!("waiting on capture process failed: {err}");
                            RunEnd::Exited(ExitKind::Code(-1))
                        }
                    };
                }
                _ = day_ticker.tick() => {
                    let today = self.clock.day_key();
                    if today != handle.day_key {
                        self.emit(SupervisorEvent::DayRollover { from: handle.day_key, to: today });
                        self.set_state(SupervisorState::Rotating);
                        self.shutdown(handle).await;
                        return RunEnd::Rotate;
                    }
                }
                _ = cancel.cancelled() => {
                    self.set_state(SupervisorState::Stopping);
                    self.shutdown(handle).await;
                    return RunEnd::Cancelled;
                }
            }
        }
    }

    async fn shutdown(&self, handle: &mut CaptureProcessHandle) {
        match handle.terminate(self.config.stop_grace).await {
            Ok((exit, timed_out)) => {
                if timed_out {
                    self.emit(SupervisorEvent::TerminationTimeout { pid: handle.pid });
                }
                self.emit(SupervisorEvent::Exited { exit });
            }
            Err(err) => log::error!("stopping capture process {:?} failed: {err}", handle.pid),
        }
    }

    async fn drain(&self, lines: &mut Lines<BufReader<ChildStderr>>) {
        while let Ok(Ok(Some(line))) = tokio::time::timeout(DRAIN_TIMEOUT, lines.next_line()).await {
            self.forward_line(&line);
        }
    }

    fn forward_line(&self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        self.observer.on_log_line(line);
        if let Some(hint) = annotate_line(line) {
            self.emit(SupervisorEvent::Hint(hint));
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            self.state = state;
            self.observer.on_state(state);
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        self.observer.on_event(&event);
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> std::io::Result<Option<String>> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}
