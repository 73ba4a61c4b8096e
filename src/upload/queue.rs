use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Dispatcher, UploadFailure, UploadOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Paths buffered before `submit` starts waiting.
    pub capacity: usize,
    /// Dispatches allowed to run at once.
    pub workers: usize,
    /// How long `shutdown` waits for running dispatches before abandoning them.
    #[serde(with = "crate::config::secs")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            workers: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: Vec<(PathBuf, UploadFailure)>,
    /// Paths still running or waiting for a worker when the shutdown timeout expired.
    pub abandoned: usize,
}

impl UploadSummary {
    fn record(&mut self, joined: std::result::Result<(PathBuf, UploadOutcome), JoinError>) {
        match joined {
            Ok((_, UploadOutcome::Uploaded { .. })) => self.uploaded += 1,
            Ok((path, UploadOutcome::Failed(failure))) => self.failed.push((path, failure)),
            Err(err) if err.is_cancelled() => self.abandoned += 1,
            Err(err) => log::error!("upload task panicked: {err}"),
        }
    }
}

type InFlight = Arc<Mutex<HashSet<PathBuf>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<PathBuf>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a path from the in-flight set when its dispatch ends, however it ends.
struct InFlightGuard {
    in_flight: InFlight,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.path);
    }
}

/// Submission side of the upload queue. Cheap to clone.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<PathBuf>,
    in_flight: InFlight,
}

impl UploadQueue {
    /// Starts the worker loop. Dispatches run on the current runtime.
    pub fn start(dispatcher: Arc<Dispatcher>, config: QueueConfig) -> (Self, UploadWorkers) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let in_flight: InFlight = Arc::default();
        let close = CancellationToken::new();
        let handle = tokio::spawn(run_workers(
            dispatcher,
            rx,
            config,
            close.clone(),
            in_flight.clone(),
        ));
        (Self { tx, in_flight }, UploadWorkers { handle, close })
    }

    /// Queues `path` for upload. Returns `false` if the path is already
    /// queued or uploading, or if the queue has shut down. Waits while the
    /// queue is full.
    pub async fn submit(&self, path: PathBuf) -> bool {
        if !lock(&self.in_flight).insert(path.clone()) {
            log::debug!("{} already queued, ignoring duplicate event", path.display());
            return false;
        }
        if let Err(mpsc::error::SendError(path)) = self.tx.send(path).await {
            log::warn!("upload queue closed, dropping {}", path.display());
            lock(&self.in_flight).remove(&path);
            return false;
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

/// Handle on the worker loop started by [`UploadQueue::start`].
pub struct UploadWorkers {
    handle: JoinHandle<UploadSummary>,
    close: CancellationToken,
}

impl UploadWorkers {
    /// Stops accepting work and dispatches what is already buffered. Anything
    /// still running when the shutdown timeout expires is abandoned.
    pub async fn shutdown(self) -> UploadSummary {
        self.close.cancel();
        match self.handle.await {
            Ok(summary) => summary,
            Err(err) => {
                log::error!("upload worker loop failed: {err}");
                UploadSummary::default()
            }
        }
    }
}

async fn run_workers(
    dispatcher: Arc<Dispatcher>,
    mut rx: mpsc::Receiver<PathBuf>,
    config: QueueConfig,
    close: CancellationToken,
    in_flight: InFlight,
) -> UploadSummary {
    let permits = Arc::new(Semaphore::new(config.workers.max(1)));
    let abort = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let mut summary = UploadSummary::default();
    // Set once shutdown starts; buffered paths are still dispatched until then.
    let mut deadline: Option<Instant> = None;
    let mut expired = false;

    loop {
        let path = tokio::select! {
            _ = close.cancelled(), if deadline.is_none() => {
                rx.close();
                deadline = Some(Instant::now() + config.shutdown_timeout);
                continue;
            }
            _ = expire(deadline) => {
                expired = true;
                break;
            }
            Some(joined) = tasks.join_next() => {
                summary.record(joined);
                continue;
            }
            path = rx.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let guard = InFlightGuard {
            in_flight: in_flight.clone(),
            path: path.clone(),
        };
        // Every worker may be busy for a long time; shutdown must still start its clock.
        let permit = loop {
            tokio::select! {
                _ = close.cancelled(), if deadline.is_none() => {
                    rx.close();
                    deadline = Some(Instant::now() + config.shutdown_timeout);
                }
                _ = expire(deadline) => {
                    expired = true;
                    break None;
                }
                Some(joined) = tasks.join_next() => summary.record(joined),
                permit = permits.clone().acquire_owned() => break permit.ok(),
            }
        };
        let Some(permit) = permit else {
            log::warn!("upload queue shutting down, {} not dispatched", path.display());
            summary.abandoned += 1;
            break;
        };

        let dispatcher = dispatcher.clone();
        let abort = abort.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let outcome = dispatcher.dispatch(&path, &abort).await;
            (path, outcome)
        });
    }

    rx.close();
    while let Ok(path) = rx.try_recv() {
        log::warn!("upload queue shutting down, {} not dispatched", path.display());
        lock(&in_flight).remove(&path);
        summary.abandoned += 1;
    }

    if !expired {
        let deadline = deadline.unwrap_or_else(|| Instant::now() + config.shutdown_timeout);
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                summary.record(joined);
            }
        })
        .await;
        expired = drained.is_err();
    }

    if expired && !tasks.is_empty() {
        log::warn!(
            "{} uploads still running after {}s, abandoning them",
            tasks.len(),
            config.shutdown_timeout.as_secs_f64()
        );
        abort.cancel();
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            summary.record(joined);
        }
    }

    log::info!(
        "upload queue stopped: {} uploaded, {} failed, {} abandoned",
        summary.uploaded,
        summary.failed.len(),
        summary.abandoned
    );
    summary
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
