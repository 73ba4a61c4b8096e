use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use recorder::clock::SystemClock;
use recorder::config::{validate_retention, RecorderConfig, StoreConfig};
use recorder::naming::Locale;
use recorder::retention::{enforce, run_pass, run_scheduled, StatvfsSpace};
use recorder::shutdown::Shutdown;
use recorder::supervisor::{FfmpegCommand, LogObserver, NotifyOnExit, Supervisor};
use recorder::upload::{Dispatcher, LocalStore, ObjectStore, SegmentEvents, UploadQueue};

#[derive(Parser)]
#[command(name = "recorder")]
#[command(about = "Record a live stream into daily segments, upload them and keep the disk from filling")]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long, global = true, env = "RECORDER_CONFIG")]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "RECORDER_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise capture, upload finished segments and run periodic retention
    Record(RecordArgs),
    /// Run a single retention pass
    Clean(CleanArgs),
    /// Upload existing segment files
    Upload(UploadArgs),
}

#[derive(clap::Args)]
struct RecordArgs {
    /// Stream URL (rtsp://...)
    #[arg(long, env = "RTSP_URL")]
    url: Option<String>,

    /// Root directory for day folders
    #[arg(long, env = "OUT_ROOT")]
    out: Option<PathBuf>,

    /// ffmpeg executable
    #[arg(long, env = "FFMPEG_BIN")]
    ffmpeg: Option<PathBuf>,

    /// Segment length in seconds
    #[arg(long)]
    segment_seconds: Option<u64>,

    /// Label and month-name language (en, es)
    #[arg(long)]
    locale: Option<Locale>,

    /// Mirror uploads into this directory instead of the configured store
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Do not upload segments
    #[arg(long)]
    no_upload: bool,

    /// Give up after this many failed attempts in total (0 = never)
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(clap::Args)]
struct CleanArgs {
    /// Directory to clean
    #[arg(long, env = "OUT_ROOT")]
    root: Option<PathBuf>,

    /// Eligible extensions (repeatable)
    #[arg(long = "ext")]
    extensions: Vec<String>,

    /// Minimum free space in percent
    #[arg(long)]
    min_free_percent: Option<f64>,

    /// Minimum free space in GB (0 = ignore)
    #[arg(long)]
    min_free_gb: Option<f64>,

    /// Maximum files deleted in this pass
    #[arg(long)]
    max_delete: Option<usize>,

    /// Delete files older than this many days even if space is sufficient
    #[arg(long)]
    max_age_days: Option<u64>,

    /// Never delete files modified within this many minutes
    #[arg(long)]
    min_age_minutes: Option<u64>,

    /// Log what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,
}

#[derive(clap::Args)]
struct UploadArgs {
    /// Mirror uploads into this directory instead of the configured store
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Label and month-name language (en, es)
    #[arg(long)]
    locale: Option<Locale>,

    /// Segment files to upload
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RecorderConfig::default(),
    };

    match cli.command {
        Command::Record(args) => {
            args.apply(&mut config);
            config.validate().context("invalid configuration")?;
            // The local offset can only be read reliably before other threads exist.
            let clock = SystemClock::local();
            runtime()?.block_on(record(config, clock))
        }
        Command::Clean(args) => clean(args, &config),
        Command::Upload(args) => {
            if let Some(dir) = args.store_dir.clone() {
                config.store = StoreConfig::Local { root: dir };
            }
            if let Some(locale) = args.locale {
                config.upload.locale = locale;
            }
            runtime()?.block_on(upload(args.files, config))
        }
    }
}

impl RecordArgs {
    fn apply(self, config: &mut RecorderConfig) {
        if let Some(url) = self.url {
            config.capture.stream_url = url;
        }
        if let Some(out) = self.out {
            config.capture.output_root = out;
        }
        if let Some(ffmpeg) = self.ffmpeg {
            config.capture.ffmpeg_bin = ffmpeg;
        }
        if let Some(seconds) = self.segment_seconds {
            config.capture.segment_seconds = seconds;
        }
        if let Some(locale) = self.locale {
            config.capture.locale = locale;
            config.upload.locale = locale;
        }
        if let Some(dir) = self.store_dir {
            config.store = StoreConfig::Local { root: dir };
        }
        if self.no_upload {
            config.store = StoreConfig::None;
        }
        if let Some(max_retries) = self.max_retries {
            config.supervisor.retry.max_retries = max_retries;
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        builder
            .target(env_logger::Target::Pipe(Box::new(file)))
            .write_style(env_logger::WriteStyle::Never);
    }
    builder.init();
    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

fn build_store(config: &StoreConfig) -> Result<Option<Arc<dyn ObjectStore>>> {
    Ok(match config {
        StoreConfig::None => None,
        StoreConfig::Local { root } => Some(Arc::new(LocalStore::new(root))),
        #[cfg(feature = "http-store")]
        StoreConfig::Http(http) => Some(Arc::new(
            recorder::upload::HttpStore::new(http.clone()).context("configuring HTTP store")?,
        )),
    })
}

async fn record(config: RecorderConfig, clock: SystemClock) -> Result<()> {
    let shutdown = Shutdown::new();
    let _signals = shutdown.listen().context("installing signal handlers")?;
    let cancel = shutdown.token();

    let root = config.capture.output_root.clone();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating output root {}", root.display()))?;
    log::info!(
        "recording {} into {} (utc offset {})",
        config.capture.redacted_url(),
        root.display(),
        clock.offset()
    );

    let uploads = match build_store(&config.store)? {
        Some(store) => {
            log::info!("uploading to {}", store.describe());
            let dispatcher = Arc::new(Dispatcher::new(store, config.upload.clone()));
            let (queue, workers) = UploadQueue::start(dispatcher, config.queue.clone());
            let events = SegmentEvents::watch(&root, &[config.capture.container.clone()])
                .context("watching output root")?;
            let forwarder = tokio::spawn(events.forward(queue, cancel.clone()));
            Some((forwarder, workers))
        }
        None => {
            log::info!("uploads disabled");
            None
        }
    };

    let capture_exited = Arc::new(Notify::new());
    let retention = tokio::spawn(run_scheduled(
        root.clone(),
        config.retention.target.clone(),
        config.retention.interval,
        capture_exited.clone(),
        StatvfsSpace,
        cancel.clone(),
    ));

    let command = Arc::new(FfmpegCommand::new(config.capture.clone()));
    let mut supervisor = Supervisor::new(command, config.supervisor.clone())
        .with_clock(Arc::new(clock))
        .with_observer(Arc::new(NotifyOnExit::new(LogObserver, capture_exited)));
    let outcome = supervisor.run(&cancel).await;

    shutdown.trigger("capture finished");
    match retention.await {
        Ok(passes) => log::debug!("{passes} retention passes while recording"),
        Err(err) => log::error!("retention scheduler failed: {err}"),
    }
    run_pass(root.clone(), config.retention.target.clone(), StatvfsSpace).await;
    if let Some((forwarder, workers)) = uploads {
        if let Err(err) = forwarder.await {
            log::error!("segment event forwarder failed: {err}");
        }
        let summary = workers.shutdown().await;
        for (path, failure) in &summary.failed {
            log::warn!("not uploaded: {} ({failure})", path.display());
        }
    }

    let report = outcome.context("capture supervision failed")?;
    log::info!(
        "stopped ({:?}) after {} launches, {} retries, {} day rotations",
        report.reason,
        report.launches,
        report.retries,
        report.rotations
    );
    Ok(())
}

fn clean(args: CleanArgs, config: &RecorderConfig) -> Result<()> {
    let root = args
        .root
        .clone()
        .unwrap_or_else(|| config.capture.output_root.clone());
    if !root.is_dir() {
        bail!("directory does not exist: {}", root.display());
    }

    let mut target = config.retention.target.clone();
    if !args.extensions.is_empty() {
        target.eligible_extensions = args.extensions;
    }
    if let Some(percent) = args.min_free_percent {
        target.min_free_percent = percent;
    }
    if let Some(gb) = args.min_free_gb {
        target.min_free_bytes = (gb.max(0.0) * 1024.0 * 1024.0 * 1024.0) as u64;
    }
    if let Some(max) = args.max_delete {
        target.max_deletions_per_pass = max;
    }
    if let Some(days) = args.max_age_days {
        target.max_age = Some(Duration::from_secs(days * 86_400));
    }
    if let Some(minutes) = args.min_age_minutes {
        target.min_age = Some(Duration::from_secs(minutes * 60));
    }
    target.dry_run |= args.dry_run;
    validate_retention(&target).context("invalid retention target")?;

    let report = enforce(&root, &target, &StatvfsSpace)
        .with_context(|| format!("retention pass on {}", root.display()))?;
    if !report.failures.is_empty() {
        log::warn!("{} files could not be deleted", report.failures.len());
    }
    Ok(())
}

async fn upload(files: Vec<PathBuf>, config: RecorderConfig) -> Result<()> {
    let Some(store) = build_store(&config.store)? else {
        bail!("no object store configured; pass --store-dir or set \"store\" in the config file");
    };
    let shutdown = Shutdown::new();
    let _signals = shutdown.listen().context("installing signal handlers")?;
    let cancel = shutdown.token();

    let dispatcher = Dispatcher::new(store, config.upload);
    let mut failed = 0usize;
    for file in &files {
        if cancel.is_cancelled() {
            break;
        }
        if !dispatcher.dispatch(file, &cancel).await.is_uploaded() {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} uploads failed", files.len());
    }
    Ok(())
}
