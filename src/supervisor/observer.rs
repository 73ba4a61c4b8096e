use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::naming::DayKey;

use super::{ExitKind, SupervisorState};

/// Something the supervisor did that an operator may want to see.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Launched { pid: Option<u32>, day_key: DayKey, launch: u32 },
    LaunchFailed { reason: String },
    Exited { exit: ExitKind },
    DayRollover { from: DayKey, to: DayKey },
    TerminationTimeout { pid: Option<u32> },
    RetryScheduled { retry: u32, delay: Duration },
    RetriesExhausted { retries: u32 },
    Hint(LineHint),
}

/// Best-effort reading of a capture log line. Display only; the supervisor
/// never changes state because of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineHint {
    Connected,
    SegmentOpened(PathBuf),
}

/// Recognises the handful of ffmpeg diagnostics worth surfacing.
pub fn annotate_line(line: &str) -> Option<LineHint> {
    if let Some(rest) = line.split("Opening '").nth(1) {
        if let Some((path, tail)) = rest.split_once('\'') {
            if tail.trim_start().starts_with("for writing") {
                return Some(LineHint::SegmentOpened(PathBuf::from(path)));
            }
        }
    }
    if line.contains("Input #") || line.contains("Stream mapping:") || line.starts_with("frame=") {
        return Some(LineHint::Connected);
    }
    None
}

/// Receives the supervisor's diagnostic stream.
///
/// All methods have empty defaults so sinks only implement what they show.
pub trait SupervisorObserver: Send + Sync {
    fn on_state(&self, _state: SupervisorState) {}

    fn on_event(&self, _event: &SupervisorEvent) {}

    fn on_log_line(&self, _line: &str) {}
}

/// Observer that writes everything to the `log` facade.
#[derive(Debug, Default)]
pub struct LogObserver;

impl SupervisorObserver for LogObserver {
    fn on_state(&self, state: SupervisorState) {
        log::debug!("supervisor state: {state:?}");
    }

    fn on_event(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::Launched { pid, day_key, launch } => {
                log::info!("capture launched (pid {pid:?}, day {day_key}, launch #{launch})");
            }
            SupervisorEvent::LaunchFailed { reason } => {
                log::error!("capture launch failed: {reason}");
            }
            SupervisorEvent::Exited { exit } if exit.is_clean() => {
                log::info!("capture exited normally ({exit})");
            }
            SupervisorEvent::Exited { exit } => {
                log::error!("capture exited with error ({exit})");
            }
            SupervisorEvent::DayRollover { from, to } => {
                log::info!("day changed {from} -> {to}, rotating capture process");
            }
            SupervisorEvent::TerminationTimeout { pid } => {
                log::warn!("capture process {pid:?} ignored graceful stop; killed");
            }
            SupervisorEvent::RetryScheduled { retry, delay } => {
                log::info!("retrying in {}s (retry {retry})", delay.as_secs_f64());
            }
            SupervisorEvent::RetriesExhausted { retries } => {
                log::error!("retry budget exhausted after {retries} failures");
            }
            SupervisorEvent::Hint(LineHint::Connected) => log::info!("stream connected"),
            SupervisorEvent::Hint(LineHint::SegmentOpened(path)) => {
                log::info!("recording {}", path.display());
            }
        }
    }

    fn on_log_line(&self, line: &str) {
        log::info!(target: "recorder::capture", "{line}");
    }
}

/// Forwards everything to `inner` and wakes `exited` each time a capture
/// process ends, including rotations.
pub struct NotifyOnExit<O> {
    inner: O,
    exited: Arc<Notify>,
}

impl<O: SupervisorObserver> NotifyOnExit<O> {
    pub fn new(inner: O, exited: Arc<Notify>) -> Self {
        Self { inner, exited }
    }
}

impl<O: SupervisorObserver> SupervisorObserver for NotifyOnExit<O> {
    fn on_state(&self, state: SupervisorState) {
        self.inner.on_state(state);
    }

    fn on_event(&self, event: &SupervisorEvent) {
        self.inner.on_event(event);
        if matches!(event, SupervisorEvent::Exited { .. }) {
            self.exited.notify_one();
        }
    }

    fn on_log_line(&self, line: &str) {
        self.inner.on_log_line(line);
    }
}
