//! Completion detection for segments still being written.
//!
//! A segment is considered finished once its size has been observed
//! unchanged, and non-zero, on `required_checks` consecutive polls. The
//! detection latency is therefore at least `required_checks * poll_interval`
//! and must stay below the shortest segment duration.
//!
//! A file that stays empty for `max_empty_checks` consecutive polls is given
//! up on, so crashed captures cannot hold a dispatch forever.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Time between size samples.
    #[serde(with = "crate::config::secs")]
    pub poll_interval: Duration,

    /// Consecutive equal samples needed to call the file stable.
    pub required_checks: u32,

    /// Consecutive zero-size samples after which the file is reported empty.
    pub max_empty_checks: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            required_checks: 3,
            max_empty_checks: 30,
        }
    }
}

/// Result of [`wait_for_stable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Stable { size: u64, polls: u32 },
    Vanished { polls: u32 },
    /// The file never received any data.
    Empty { polls: u32 },
    Cancelled,
}

impl Completion {
    pub fn is_stable(&self) -> bool {
        matches!(self, Completion::Stable { .. })
    }
}

/// Reads the current size of a path. `Ok(None)` means the path is gone.
pub trait SizeProbe: Send + Sync {
    fn size(&self, path: &Path) -> io::Result<Option<u64>>;
}

/// Probe backed by filesystem metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl SizeProbe for FsProbe {
    fn size(&self, path: &Path) -> io::Result<Option<u64>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Polls `path` until its size settles, it disappears, or `cancel` fires.
///
/// Transient metadata errors other than "not found" count as a size change,
/// so the stability counter restarts.
pub async fn wait_for_stable<P>(
    probe: &P,
    path: &Path,
    config: &StabilityConfig,
    cancel: &CancellationToken,
) -> Completion
where
    P: SizeProbe + ?Sized,
{
    let required = config.required_checks.max(1);
    let empty_limit = config.max_empty_checks.max(1);
    let mut last_size: Option<u64> = None;
    let mut stable_count = 0u32;
    let mut empty_count = 0u32;
    let mut polls = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Completion::Cancelled,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
        polls += 1;

        let size = match probe.size(path) {
            Ok(Some(size)) => size,
            Ok(None) => {
                log::debug!("{} vanished after {polls} polls", path.display());
                return Completion::Vanished { polls };
            }
            Err(err) => {
                log::debug!("size probe failed for {}: {err}", path.display());
                last_size = None;
                stable_count = 0;
                empty_count = 0;
                continue;
            }
        };

        if size == 0 {
            empty_count += 1;
            if empty_count >= empty_limit {
                log::debug!("{} still empty after {polls} polls", path.display());
                return Completion::Empty { polls };
            }
        } else {
            empty_count = 0;
        }

        if size > 0 && last_size == Some(size) {
            stable_count += 1;
        } else {
            last_size = Some(size);
            stable_count = u32::from(size > 0);
        }

        if stable_count >= required {
            return Completion::Stable { size, polls };
        }
    }
}
