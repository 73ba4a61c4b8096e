use std::cell::Cell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use recorder::retention::{enforce, run_scheduled, DiskSpace, RetentionTarget, SpaceUsage};
use tempfile::tempdir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A filesystem of fixed capacity whose only contents are the files under
/// the scanned root.
#[derive(Debug, Clone, Copy)]
struct VirtualDisk {
    capacity: u64,
}

impl DiskSpace for VirtualDisk {
    fn usage(&self, path: &Path) -> io::Result<SpaceUsage> {
        let used = tree_size(path)?;
        Ok(SpaceUsage {
            total: self.capacity,
            free: self.capacity.saturating_sub(used),
        })
    }
}

/// Turns `victim` into a directory on the first free-space re-read, after
/// the pass has planned to delete it.
struct SwapBeforeDelete {
    disk: VirtualDisk,
    victim: PathBuf,
    reads: Cell<u32>,
}

impl DiskSpace for SwapBeforeDelete {
    fn usage(&self, path: &Path) -> io::Result<SpaceUsage> {
        let reads = self.reads.get();
        self.reads.set(reads + 1);
        if reads == 1 {
            fs::remove_file(&self.victim)?;
            fs::create_dir(&self.victim)?;
        }
        self.disk.usage(path)
    }
}

fn tree_size(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            tree_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

fn write_aged(path: &Path, bytes: usize, age_secs: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, vec![0u8; bytes]).expect("write");
    fs::File::options()
        .write(true)
        .open(path)
        .expect("open")
        .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .expect("set mtime");
}

fn target(min_free_percent: f64) -> RetentionTarget {
    RetentionTarget {
        min_free_percent,
        ..RetentionTarget::default()
    }
}

#[test]
fn cap_limits_a_single_pass() {
    let dir = tempdir().expect("tempdir");
    for i in 0..1000u64 {
        let day = dir.path().join(format!("day-{}", i / 100));
        write_aged(&day.join(format!("seg-{i:04}.mp4")), 1, 10_000 - i);
    }
    let disk = VirtualDisk { capacity: 1000 };

    let report = enforce(dir.path(), &target(90.0), &disk).expect("enforce");
    assert_eq!(report.files_deleted, 500);
    assert!(report.cap_reached);
    assert!(!report.threshold_met);
    assert_eq!(report.final_free_bytes, 500);
    assert!(!dir.path().join("day-0").exists());
    assert!(dir.path().join("day-5/seg-0500.mp4").exists());
}

#[test]
fn second_pass_after_success_deletes_nothing() {
    let dir = tempdir().expect("tempdir");
    for i in 0..10u64 {
        write_aged(&dir.path().join(format!("seg-{i}.mkv")), 10, 1000 - i);
    }
    let disk = VirtualDisk { capacity: 200 };

    let first = enforce(dir.path(), &target(60.0), &disk).expect("first pass");
    assert_eq!(first.files_deleted, 2);
    assert!(first.threshold_met);

    let second = enforce(dir.path(), &target(60.0), &disk).expect("second pass");
    assert_eq!(second.files_deleted, 0);
    assert!(second.threshold_met);
}

#[test]
fn deletes_oldest_first_and_only_eligible_extensions() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write_aged(&root.join("2025-10-12/b.mp4"), 10, 3000);
    write_aged(&root.join("2025-10-11/a.avi"), 10, 4000);
    write_aged(&root.join("2025-10-13/c.mp4"), 10, 2000);
    write_aged(&root.join("notes.txt"), 10, 9000);
    write_aged(&root.join("2025-10-10/old.log"), 10, 8000);
    let disk = VirtualDisk { capacity: 60 };

    let report = enforce(root, &target(50.0), &disk).expect("enforce");
    let expected: Vec<PathBuf> = vec![root.join("2025-10-11/a.avi"), root.join("2025-10-12/b.mp4")];
    assert_eq!(report.deleted, expected);
    assert_eq!(
        report.planned,
        vec![
            root.join("2025-10-11/a.avi"),
            root.join("2025-10-12/b.mp4"),
            root.join("2025-10-13/c.mp4"),
        ]
    );
    assert!(root.join("notes.txt").exists());
    assert!(root.join("2025-10-10/old.log").exists());
    assert!(!root.join("2025-10-11").exists());
    assert!(!root.join("2025-10-12").exists());
    assert!(root.join("2025-10-13/c.mp4").exists());
}

#[test]
fn dry_run_changes_nothing_and_matches_real_order() {
    let dir = tempdir().expect("tempdir");
    for i in 0..6u64 {
        write_aged(&dir.path().join(format!("d{}/seg-{i}.mp4", i % 2)), 10, 600 - i * 10);
    }
    let disk = VirtualDisk { capacity: 100 };
    let mut dry = target(70.0);
    dry.dry_run = true;

    let simulated = enforce(dir.path(), &dry, &disk).expect("dry run");
    assert!(simulated.deleted.is_empty());
    assert_eq!(simulated.would_delete.len(), 3);
    for i in 0..6u64 {
        assert!(dir.path().join(format!("d{}/seg-{i}.mp4", i % 2)).exists());
    }

    assert_eq!(simulated.would_free, 30);
    assert_eq!(simulated.bytes_freed, 0);

    let real = enforce(dir.path(), &target(70.0), &disk).expect("real run");
    assert_eq!(real.planned, simulated.planned);
    assert_eq!(real.deleted, simulated.would_delete);
    assert_eq!(real.bytes_freed, simulated.would_free);
}

#[test]
fn failed_deletion_is_skipped_and_the_pass_continues() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write_aged(&root.join("a.mp4"), 10, 3000);
    write_aged(&root.join("b.mp4"), 10, 2000);
    write_aged(&root.join("c.mp4"), 10, 1000);
    let disk = SwapBeforeDelete {
        disk: VirtualDisk { capacity: 60 },
        victim: root.join("a.mp4"),
        reads: Cell::new(0),
    };

    let report = enforce(root, &target(70.0), &disk).expect("enforce");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, root.join("a.mp4"));
    assert_eq!(report.deleted, vec![root.join("b.mp4")]);
    assert!(report.threshold_met);
    assert!(root.join("c.mp4").exists());
}

#[tokio::test]
async fn scheduled_passes_run_when_capture_exits() {
    let dir = tempdir().expect("tempdir");
    let oldest = dir.path().join("seg-0.mp4");
    let newer = dir.path().join("seg-1.mp4");
    write_aged(&oldest, 10, 300);
    write_aged(&newer, 10, 200);

    let wake = Arc::new(Notify::new());
    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduled(
        dir.path().to_path_buf(),
        target(60.0),
        None,
        wake.clone(),
        VirtualDisk { capacity: 40 },
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(oldest.exists(), "no pass should run before an exit");

    wake.notify_one();
    tokio::time::timeout(Duration::from_secs(5), async {
        while oldest.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pass after exit");
    cancel.cancel();

    assert_eq!(scheduler.await.expect("join"), 1);
    assert!(newer.exists());
}

#[test]
fn no_eligible_files_reports_unmet_threshold() {
    let dir = tempdir().expect("tempdir");
    write_aged(&dir.path().join("keep.txt"), 50, 100);
    let disk = VirtualDisk { capacity: 60 };

    let report = enforce(dir.path(), &target(50.0), &disk).expect("enforce");
    assert!(report.planned.is_empty());
    assert_eq!(report.files_deleted, 0);
    assert!(!report.threshold_met);
}
