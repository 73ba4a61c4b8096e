//! Free-space retention.
//!
//! A pass deletes the oldest eligible files under a root until the configured
//! free-space thresholds hold, never exceeding `max_deletions_per_pass`
//! deletions. Free space is re-read before every deletion, so space released
//! by other processes ends the pass early.
//!
//! While recording, [`run_scheduled`] repeats passes on an interval and
//! whenever the capture process exits.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::naming::has_extension;
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionTarget {
    /// Minimum free space as a percentage of the filesystem. 0 disables.
    pub min_free_percent: f64,
    /// Minimum free space in bytes. 0 disables.
    pub min_free_bytes: u64,
    pub max_deletions_per_pass: usize,
    pub eligible_extensions: Vec<String>,
    pub dry_run: bool,
    /// Files modified more recently than this are never deleted.
    #[serde(with = "crate::config::opt_secs")]
    pub min_age: Option<Duration>,
    /// Files older than this are deleted even when space is sufficient.
    #[serde(with = "crate::config::opt_secs")]
    pub max_age: Option<Duration>,
}

impl Default for RetentionTarget {
    fn default() -> Self {
        Self {
            min_free_percent: 15.0,
            min_free_bytes: 0,
            max_deletions_per_pass: 500,
            eligible_extensions: vec!["mkv".into(), "mp4".into(), "avi".into()],
            dry_run: false,
            min_age: None,
            max_age: None,
        }
    }
}

impl RetentionTarget {
    /// True when no configured threshold is violated.
    pub fn is_satisfied(&self, usage: SpaceUsage) -> bool {
        let percent_ok = self.min_free_percent <= 0.0 || usage.free_percent() >= self.min_free_percent;
        let bytes_ok = self.min_free_bytes == 0 || usage.free >= self.min_free_bytes;
        percent_ok && bytes_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub total: u64,
    pub free: u64,
}

impl SpaceUsage {
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    pub fn free_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.free as f64 / self.total as f64 * 100.0
    }
}

/// Source of filesystem capacity figures.
pub trait DiskSpace {
    fn usage(&self, path: &Path) -> io::Result<SpaceUsage>;
}

/// Space as reported by `statvfs(3)`, counting blocks available to
/// unprivileged users as free.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsSpace;

impl DiskSpace for StatvfsSpace {
    fn usage(&self, path: &Path) -> io::Result<SpaceUsage> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // SAFETY: `statvfs` is plain old data, so the all-zero value is valid.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `c_path` is NUL-terminated and outlives the call; `stat` is writable.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let frsize = stat.f_frsize as u64;
        Ok(SpaceUsage {
            total: (stat.f_blocks as u64).saturating_mul(frsize),
            free: (stat.f_bavail as u64).saturating_mul(frsize),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    /// Bytes a dry run would have freed.
    pub would_free: u64,
    pub final_free_percent: f64,
    pub final_free_bytes: u64,
    /// Every eligible file, oldest first. Identical for real and dry runs.
    pub planned: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Files a dry run would have deleted.
    pub would_delete: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
    pub threshold_met: bool,
    pub cap_reached: bool,
}

pub fn enforce(root: &Path, target: &RetentionTarget, disk: &dyn DiskSpace) -> Result<RetentionReport> {
    enforce_at(root, target, disk, SystemTime::now())
}

/// [`enforce`] with an explicit notion of "now" for age checks.
pub fn enforce_at(
    root: &Path,
    target: &RetentionTarget,
    disk: &dyn DiskSpace,
    now: SystemTime,
) -> Result<RetentionReport> {
    let initial = disk.usage(root)?;
    log::info!(
        "retention pass on {} (extensions: {}, min free {:.2}% / {}, cap {}, dry run {})",
        root.display(),
        target.eligible_extensions.join(", "),
        target.min_free_percent,
        human_size(target.min_free_bytes),
        target.max_deletions_per_pass,
        target.dry_run
    );
    log::info!(
        "space: total {}, used {}, free {} ({:.2}%)",
        human_size(initial.total),
        human_size(initial.used()),
        human_size(initial.free),
        initial.free_percent()
    );

    let mut report = RetentionReport {
        final_free_percent: initial.free_percent(),
        final_free_bytes: initial.free,
        threshold_met: target.is_satisfied(initial),
        ..RetentionReport::default()
    };
    if report.threshold_met && target.max_age.is_none() {
        log::info!("thresholds met, nothing to delete");
        return Ok(report);
    }

    let candidates = collect_candidates(root, target, now)?;
    report.planned = candidates.iter().map(|c| c.path.clone()).collect();
    if candidates.is_empty() {
        log::warn!("no eligible files under {}", root.display());
    }

    let age_of = |c: &Candidate| now.duration_since(c.modified).unwrap_or_default();
    let mut usage = initial;
    let mut removed = 0usize;

    for candidate in &candidates {
        if removed >= target.max_deletions_per_pass {
            report.cap_reached = true;
            log::warn!(
                "deletion cap reached ({} files), stopping",
                target.max_deletions_per_pass
            );
            break;
        }

        if !target.dry_run {
            usage = match disk.usage(root) {
                Ok(usage) => usage,
                Err(err) => {
                    log::warn!("re-reading free space failed: {err}");
                    usage
                }
            };
        }
        let expired = target.max_age.is_some_and(|max| age_of(candidate) > max);
        if target.is_satisfied(usage) && !expired {
            // Candidates are oldest first, so nothing later is expired either.
            break;
        }

        if target.dry_run {
            log::info!(
                "[dry run] would delete {} ({})",
                candidate.path.display(),
                human_size(candidate.size)
            );
            usage.free = usage.free.saturating_add(candidate.size).min(usage.total);
            report.would_free += candidate.size;
            report.would_delete.push(candidate.path.clone());
            removed += 1;
            continue;
        }

        match fs::remove_file(&candidate.path) {
            Ok(()) => {
                removed += 1;
                report.bytes_freed += candidate.size;
                report.deleted.push(candidate.path.clone());
                let after = disk.usage(root).unwrap_or(usage);
                log::info!(
                    "deleted {} ({}), free {} ({:.2}%)",
                    candidate.path.display(),
                    human_size(candidate.size),
                    human_size(after.free),
                    after.free_percent()
                );
                prune_empty_parents(root, &candidate.path);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} vanished before deletion", candidate.path.display());
            }
            Err(err) => {
                log::error!("failed to delete {}: {err}", candidate.path.display());
                report.failures.push((candidate.path.clone(), err.to_string()));
            }
        }
    }

    let last = if target.dry_run {
        usage
    } else {
        disk.usage(root).unwrap_or(usage)
    };
    report.files_deleted = report.deleted.len();
    report.final_free_percent = last.free_percent();
    report.final_free_bytes = last.free;
    report.threshold_met = target.is_satisfied(last);

    let (count, bytes) = if target.dry_run {
        (report.would_delete.len(), report.would_free)
    } else {
        (report.files_deleted, report.bytes_freed)
    };
    log::info!(
        "retention pass done: {}{count} deleted ({}), free {} ({:.2}%)",
        if target.dry_run { "[dry run] " } else { "" },
        human_size(bytes),
        human_size(last.free),
        last.free_percent()
    );
    if !report.threshold_met {
        log::warn!("free-space threshold still unmet; consider raising the cap or widening the extensions");
    }
    Ok(report)
}

/// Runs [`enforce`] on the blocking pool and logs the outcome.
pub async fn run_pass<D>(root: PathBuf, target: RetentionTarget, disk: D) -> Option<RetentionReport>
where
    D: DiskSpace + Send + 'static,
{
    match tokio::task::spawn_blocking(move || enforce(&root, &target, &disk)).await {
        Ok(Ok(report)) => {
            log::debug!(
                "retention: {} deleted, {:.2}% free",
                report.files_deleted,
                report.final_free_percent
            );
            Some(report)
        }
        Ok(Err(err)) => {
            log::warn!("retention pass failed: {err}");
            None
        }
        Err(err) => {
            log::error!("retention task failed: {err}");
            None
        }
    }
}

/// Runs a pass every `every`, if set, and each time `wake` is notified,
/// until `cancel` fires. Returns the number of passes started.
pub async fn run_scheduled<D>(
    root: PathBuf,
    target: RetentionTarget,
    every: Option<Duration>,
    wake: Arc<Notify>,
    disk: D,
    cancel: CancellationToken,
) -> usize
where
    D: DiskSpace + Clone + Send + 'static,
{
    let mut ticker = every.map(|every| {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    if let Some(ticker) = ticker.as_mut() {
        ticker.tick().await;
    }

    let mut passes = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = next_tick(&mut ticker) => {}
            _ = wake.notified() => log::debug!("capture exited, running retention"),
        }
        passes += 1;
        run_pass(root.clone(), target.clone(), disk.clone()).await;
    }
    passes
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Eligible files under `root`, oldest first. Ties break on path.
pub fn collect_candidates(root: &Path, target: &RetentionTarget, now: SystemTime) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if dir == root => return Err(err.into()),
            Err(err) => {
                log::warn!("skipping unreadable directory {}: {err}", dir.display());
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() || !has_extension(&path, &target.eligible_extensions) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(min_age) = target.min_age {
                if now.duration_since(modified).unwrap_or_default() < min_age {
                    continue;
                }
            }
            out.push(Candidate {
                path,
                size: meta.len(),
                modified,
            });
        }
    }

    out.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(out)
}

fn prune_empty_parents(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if fs::remove_dir(current).is_err() {
            break;
        }
        log::debug!("removed empty directory {}", current.display());
        dir = current.parent();
    }
}

/// Formats a byte count with binary units, e.g. `1.50 GB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Fixed(Cell<SpaceUsage>);

    impl DiskSpace for Fixed {
        fn usage(&self, _path: &Path) -> io::Result<SpaceUsage> {
            Ok(self.0.get())
        }
    }

    #[test]
    fn human_size_uses_binary_units() {
        assert_eq!(human_size(512), "512.00 B");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn thresholds_combine_percent_and_bytes() {
        let usage = SpaceUsage { total: 1000, free: 200 };
        let mut target = RetentionTarget {
            min_free_percent: 15.0,
            ..RetentionTarget::default()
        };
        assert!(target.is_satisfied(usage));
        target.min_free_bytes = 300;
        assert!(!target.is_satisfied(usage));
        target.min_free_percent = 0.0;
        target.min_free_bytes = 0;
        assert!(target.is_satisfied(SpaceUsage { total: 1000, free: 0 }));
    }

    #[test]
    fn satisfied_thresholds_skip_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        let disk = Fixed(Cell::new(SpaceUsage { total: 100, free: 50 }));

        let report = enforce(dir.path(), &RetentionTarget::default(), &disk).unwrap();
        assert!(report.threshold_met);
        assert!(report.planned.is_empty());
        assert!(dir.path().join("a.mp4").exists());
    }

    #[test]
    fn min_age_protects_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp4");
        std::fs::write(&path, b"x").unwrap();
        let target = RetentionTarget {
            min_age: Some(Duration::from_secs(3600)),
            ..RetentionTarget::default()
        };
        let disk = Fixed(Cell::new(SpaceUsage { total: 100, free: 0 }));

        let report = enforce(dir.path(), &target, &disk).unwrap();
        assert!(report.planned.is_empty());
        assert!(!report.threshold_met);
        assert!(path.exists());
    }

    #[test]
    fn max_age_deletes_only_expired_files_when_space_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.mp4");
        let new = dir.path().join("new.mp4");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&new, b"x").unwrap();
        let now = SystemTime::now();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(now - Duration::from_secs(10 * 86_400))
            .unwrap();

        let target = RetentionTarget {
            max_age: Some(Duration::from_secs(7 * 86_400)),
            ..RetentionTarget::default()
        };
        let disk = Fixed(Cell::new(SpaceUsage { total: 100, free: 90 }));

        let report = enforce_at(dir.path(), &target, &disk, now).unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(!old.exists());
        assert!(new.exists());
        assert!(report.threshold_met);
    }

    #[test]
    fn missing_root_is_an_error() {
        let disk = Fixed(Cell::new(SpaceUsage { total: 100, free: 0 }));
        let err = enforce(Path::new("/definitely/not/here"), &RetentionTarget::default(), &disk);
        assert!(err.is_err());
    }

    #[test]
    fn statvfs_reports_some_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let usage = StatvfsSpace.usage(dir.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.free <= usage.total);
    }
}
