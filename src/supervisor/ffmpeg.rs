use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::naming::{day_dir, day_label, strftime_pattern, Locale};
use crate::{Error, Result};

use super::{CaptureCommand, LaunchContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    Copy,
    Aac,
    #[default]
    None,
}

impl std::str::FromStr for AudioMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "copy" => Ok(AudioMode::Copy),
            "aac" => Ok(AudioMode::Aac),
            "none" => Ok(AudioMode::None),
            other => Err(Error::Config(format!("unknown audio mode: {other}"))),
        }
    }
}

/// Settings for the segmenting ffmpeg invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub stream_url: String,
    pub output_root: PathBuf,
    pub ffmpeg_bin: PathBuf,
    /// Container extension without the dot (`mp4`, `mkv`).
    pub container: String,
    /// `copy` or an encoder name such as `libx264`.
    pub video_mode: String,
    pub audio: AudioMode,
    /// Segment length; segments are cut on wall-clock multiples of it.
    pub segment_seconds: u64,
    /// RTSP socket timeout in microseconds. 0 leaves ffmpeg's default.
    pub socket_timeout_us: u64,
    pub locale: Locale,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            output_root: PathBuf::from("recordings"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            container: "mp4".to_string(),
            video_mode: "copy".to_string(),
            audio: AudioMode::None,
            segment_seconds: 3600,
            socket_timeout_us: 0,
            locale: Locale::English,
        }
    }
}

impl CaptureConfig {
    pub fn new(stream_url: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            stream_url: stream_url.into(),
            output_root: output_root.into(),
            ..Self::default()
        }
    }

    /// The stream URL with any embedded credentials masked, for logging.
    pub fn redacted_url(&self) -> String {
        redact_url(&self.stream_url)
    }
}

/// Builds ffmpeg segment-muxer commands from a [`CaptureConfig`].
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    config: CaptureConfig,
}

impl FfmpegCommand {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Argument vector for a launch, without the binary.
    pub fn args(&self, ctx: &LaunchContext) -> Vec<String> {
        let cfg = &self.config;
        let label = day_label(cfg.locale, ctx.day_key);
        let pattern = strftime_pattern(&cfg.output_root, label, ctx.day_key, &cfg.container);

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "info".into(),
            "-rtsp_transport".into(),
            "tcp".into(),
        ];
        if cfg.socket_timeout_us > 0 {
            args.push("-timeout".into());
            args.push(cfg.socket_timeout_us.to_string());
        }
        args.extend([
            "-use_wallclock_as_timestamps".into(),
            "1".into(),
            "-i".into(),
            cfg.stream_url.clone(),
            "-map".into(),
            "0:v:0".into(),
            "-c:v".into(),
            cfg.video_mode.clone(),
        ]);

        match cfg.audio {
            AudioMode::Copy => args.extend(["-map", "0:a:0?", "-c:a", "copy"].map(String::from)),
            AudioMode::Aac => {
                args.extend(["-map", "0:a:0?", "-c:a", "aac", "-b:a", "128k"].map(String::from))
            }
            AudioMode::None => args.push("-an".into()),
        }

        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            cfg.segment_seconds.to_string(),
            "-segment_atclocktime".into(),
            "1".into(),
            "-reset_timestamps".into(),
            "1".into(),
        ]);
        if cfg.container == "mp4" {
            args.push("-segment_format_options".into());
            args.push("movflags=+faststart".into());
        }
        args.extend([
            "-strftime".into(),
            "1".into(),
            pattern.to_string_lossy().into_owned(),
        ]);
        args
    }
}

impl CaptureCommand for FfmpegCommand {
    fn build(&self, ctx: &LaunchContext) -> Result<Command> {
        if self.config.stream_url.is_empty() {
            return Err(Error::Config("stream url is empty".to_string()));
        }
        let dir = day_dir(&self.config.output_root, ctx.day_key);
        std::fs::create_dir_all(&dir)
            .map_err(|err| Error::Launch(format!("create {}: {err}", dir.display())))?;

        let args = self.args(ctx);
        log::info!(
            "CMD: {} {}",
            self.config.ffmpeg_bin.display(),
            redact(&args, &self.config.stream_url).join(" ")
        );
        let mut command = Command::new(&self.config.ffmpeg_bin);
        command.args(&args);
        Ok(command)
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}***{}", &url[..scheme + 3], &url[at..]),
        _ => url.to_string(),
    }
}

/// Hides credentials embedded in the stream URL before logging.
fn redact(args: &[String], url: &str) -> Vec<String> {
    let masked = redact_url(url);
    args.iter()
        .map(|arg| if arg == url { masked.clone() } else { arg.clone() })
        .collect()
}
