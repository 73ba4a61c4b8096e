use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::naming::{Locale, SegmentName};
use crate::watcher::{wait_for_stable, Completion, FsProbe, SizeProbe, StabilityConfig};

use super::ObjectStore;

/// Lifecycle of one segment as seen by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Growing,
    Stable,
    Vanished,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    /// The watcher did not report the segment as stable.
    Incomplete(Completion),
    /// The file name does not match the segment naming convention.
    UnparseableName(String),
    /// The store rejected the transfer on every attempt.
    Store(String),
}

impl std::fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadFailure::Incomplete(completion) => write!(f, "incomplete segment ({completion:?})"),
            UploadFailure::UnparseableName(name) => write!(f, "unparseable name: {name}"),
            UploadFailure::Store(reason) => write!(f, "store error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { key: String, bytes: u64 },
    Failed(UploadFailure),
}

impl UploadOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }
}

/// One segment's trip to remote storage.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub segment_path: PathBuf,
    pub object_key: Option<String>,
    pub state: SegmentState,
    pub attempts: u32,
}

impl UploadJob {
    pub fn new(segment_path: impl Into<PathBuf>) -> Self {
        Self {
            segment_path: segment_path.into(),
            object_key: None,
            state: SegmentState::Growing,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub stability: StabilityConfig,
    /// Language of the month component in object keys.
    pub locale: Locale,
    /// Extra transfer attempts after a store failure. 0 = single attempt.
    pub store_retries: u32,
    /// Delay before the first extra attempt; doubles after each one.
    #[serde(with = "crate::config::secs")]
    pub store_retry_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            stability: StabilityConfig::default(),
            locale: Locale::English,
            store_retries: 3,
            store_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Waits for a segment to settle and hands it to the object store.
pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    probe: Arc<dyn SizeProbe>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ObjectStore>, config: DispatchConfig) -> Self {
        Self {
            store,
            probe: Arc::new(FsProbe),
            config,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn SizeProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub async fn dispatch(&self, path: &Path, cancel: &CancellationToken) -> UploadOutcome {
        let mut job = UploadJob::new(path);
        self.run_job(&mut job, cancel).await
    }

    pub async fn run_job(&self, job: &mut UploadJob, cancel: &CancellationToken) -> UploadOutcome {
        let path = job.segment_path.clone();

        let completion =
            wait_for_stable(self.probe.as_ref(), &path, &self.config.stability, cancel).await;
        let bytes = match completion {
            Completion::Stable { size, .. } => {
                job.state = SegmentState::Stable;
                size
            }
            Completion::Vanished { .. } => {
                job.state = SegmentState::Vanished;
                log::warn!("segment vanished before it settled: {}", path.display());
                return UploadOutcome::Failed(UploadFailure::Incomplete(completion));
            }
            Completion::Empty { polls } => {
                job.state = SegmentState::Failed;
                log::warn!("segment never received data after {polls} polls: {}", path.display());
                return UploadOutcome::Failed(UploadFailure::Incomplete(completion));
            }
            Completion::Cancelled => {
                job.state = SegmentState::Failed;
                log::info!("upload of {} abandoned: cancelled", path.display());
                return UploadOutcome::Failed(UploadFailure::Incomplete(completion));
            }
        };

        let name = match SegmentName::from_path(&path) {
            Ok(name) => name,
            Err(err) => {
                job.state = SegmentState::Failed;
                log::error!("not uploading {}: {err}", path.display());
                return UploadOutcome::Failed(UploadFailure::UnparseableName(
                    path.display().to_string(),
                ));
            }
        };
        let key = name.object_key(self.config.locale);
        job.object_key = Some(key.clone());

        let mut delay = self.config.store_retry_delay;
        loop {
            job.attempts += 1;
            match self.store.put_file(&key, &path).await {
                Ok(()) => {
                    job.state = SegmentState::Uploaded;
                    log::info!(
                        "uploaded {} -> {} ({})",
                        path.display(),
                        key,
                        self.store.describe()
                    );
                    return UploadOutcome::Uploaded { key, bytes };
                }
                Err(err) if job.attempts <= self.config.store_retries => {
                    log::warn!(
                        "upload attempt {} of {} failed: {err}; retrying in {}s",
                        job.attempts,
                        path.display(),
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            job.state = SegmentState::Failed;
                            return UploadOutcome::Failed(UploadFailure::Store(err.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = delay.saturating_mul(2);
                }
                Err(err) => {
                    job.state = SegmentState::Failed;
                    log::error!("upload of {} failed: {err}", path.display());
                    return UploadOutcome::Failed(UploadFailure::Store(err.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::LocalStore;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for Flaky {
        async fn put_file(&self, _key: &str, path: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Store {
                    path: path.to_path_buf(),
                    reason: "503".into(),
                });
            }
            Ok(())
        }

        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    fn fast_config(store_retries: u32) -> DispatchConfig {
        DispatchConfig {
            stability: StabilityConfig {
                poll_interval: Duration::from_millis(5),
                required_checks: 2,
                max_empty_checks: 4,
            },
            locale: Locale::Spanish,
            store_retries,
            store_retry_delay: Duration::from_millis(1),
        }
    }

    fn segment(dir: &Path, name: &str) -> PathBuf {
        let day = dir.join("2025-10-13");
        std::fs::create_dir_all(&day).unwrap();
        let path = day.join(name);
        std::fs::write(&path, vec![7u8; 128]).unwrap();
        path
    }

    #[tokio::test]
    async fn uploads_under_derived_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment(dir.path(), "Lunes_2025-10-13_00-00-00.mp4");
        let bucket = dir.path().join("bucket");
        let dispatcher = Dispatcher::new(Arc::new(LocalStore::new(&bucket)), fast_config(0));

        let outcome = dispatcher.dispatch(&path, &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            UploadOutcome::Uploaded {
                key: "2025/Octubre/13/Lunes_2025-10-13_00-00-00.mp4".into(),
                bytes: 128
            }
        );
        assert!(bucket.join("2025/Octubre/13/Lunes_2025-10-13_00-00-00.mp4").exists());
    }

    #[tokio::test]
    async fn malformed_name_is_not_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment(dir.path(), "clip.mp4");
        let store = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(store.clone(), fast_config(3));

        let mut job = UploadJob::new(&path);
        let outcome = dispatcher.run_job(&mut job, &CancellationToken::new()).await;
        assert!(matches!(outcome, UploadOutcome::Failed(UploadFailure::UnparseableName(_))));
        assert_eq!(job.state, SegmentState::Failed);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failures_are_retried_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment(dir.path(), "Lunes_2025-10-13_01-00-00.mp4");
        let store = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(store.clone(), fast_config(2));

        let mut job = UploadJob::new(&path);
        let outcome = dispatcher.run_job(&mut job, &CancellationToken::new()).await;
        assert!(outcome.is_uploaded());
        assert_eq!(job.attempts, 3);
        assert_eq!(job.state, SegmentState::Uploaded);
    }

    #[tokio::test]
    async fn zero_retries_reports_the_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment(dir.path(), "Lunes_2025-10-13_02-00-00.mp4");
        let store = Arc::new(Flaky {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(store.clone(), fast_config(0));

        let outcome = dispatcher.dispatch(&path, &CancellationToken::new()).await;
        assert!(matches!(outcome, UploadOutcome::Failed(UploadFailure::Store(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn vanished_segment_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(LocalStore::new(dir.path())), fast_config(0));
        let outcome = dispatcher
            .dispatch(&dir.path().join("Lunes_2025-10-13_03-00-00.mp4"), &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            UploadOutcome::Failed(UploadFailure::Incomplete(Completion::Vanished { .. }))
        ));
    }

    #[tokio::test]
    async fn empty_segment_releases_the_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Lunes_2025-10-13_04-00-00.mp4");
        std::fs::write(&path, b"").unwrap();
        let store = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let dispatcher = Dispatcher::new(store.clone(), fast_config(0));

        let mut job = UploadJob::new(&path);
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.run_job(&mut job, &CancellationToken::new()),
        )
        .await
        .expect("empty file is given up on");
        assert_eq!(
            outcome,
            UploadOutcome::Failed(UploadFailure::Incomplete(Completion::Empty { polls: 4 }))
        );
        assert_eq!(job.state, SegmentState::Failed);
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }
}
