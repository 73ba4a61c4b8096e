//! File-creation events for new segments.

use std::path::{Path, PathBuf};

use notify::event::CreateKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::naming::has_extension;
use crate::Result;

use super::UploadQueue;

const EVENT_BUFFER: usize = 256;

/// Stream of newly created segment paths under a root directory.
///
/// Each created file is reported once. Files that appear inside a freshly
/// created directory before the recursive watch reaches it are picked up by
/// scanning the directory when its own creation event arrives.
pub struct SegmentEvents {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<PathBuf>,
}

impl SegmentEvents {
    pub fn watch(root: &Path, extensions: &[String]) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let extensions = extensions.to_vec();

        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for path in created_segments(&event, &extensions) {
                        // Runs on the notify thread, outside the runtime.
                        if tx.blocking_send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => log::warn!("file watch error: {err}"),
            },
            Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        log::info!("watching {} for new segments", root.display());

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn next(&mut self) -> Option<PathBuf> {
        self.rx.recv().await
    }

    /// Submits every new segment to `queue` until `cancel` fires.
    pub async fn forward(mut self, queue: UploadQueue, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                path = self.next() => match path {
                    Some(path) => {
                        log::debug!("new segment {}", path.display());
                        queue.submit(path).await;
                    }
                    None => break,
                },
            }
        }
    }
}

fn created_segments(event: &Event, extensions: &[String]) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .iter()
            .flat_map(|dir| scan_dir(dir, extensions))
            .collect(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|path| has_extension(path, extensions) && !path.is_dir())
            .cloned()
            .collect(),
        _ => Vec::new(),
    }
}

fn scan_dir(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();
    found.sort();
    found
}
