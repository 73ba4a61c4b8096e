//! Recorder configuration file.
//!
//! Every field has a default, so a config file only needs the values that
//! differ. Durations are written as (fractional) seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retention::RetentionTarget;
use crate::supervisor::{CaptureConfig, SupervisorConfig};
use crate::upload::{DispatchConfig, QueueConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
    pub upload: DispatchConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub retention: RetentionConfig,
}

/// Where finished segments go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Uploads disabled.
    #[default]
    None,
    Local { root: PathBuf },
    #[cfg(feature = "http-store")]
    Http(crate::upload::HttpStoreConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(flatten)]
    pub target: RetentionTarget,
    /// Time between retention passes while recording. A pass also runs
    /// whenever a capture process exits, which with `None` is the only
    /// trigger: every failure, retry and day rotation.
    #[serde(with = "opt_secs")]
    pub interval: Option<Duration>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            target: RetentionTarget::default(),
            interval: Some(Duration::from_secs(600)),
        }
    }
}

impl RecorderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.stream_url.trim().is_empty() {
            return Err(Error::Config("stream URL is empty".into()));
        }
        if self.upload.stability.required_checks == 0 {
            return Err(Error::Config("stability check count must be at least 1".into()));
        }
        if self.upload.stability.poll_interval.is_zero() {
            return Err(Error::Config("stability poll interval must be positive".into()));
        }
        if self.queue.workers == 0 {
            return Err(Error::Config("upload worker count must be at least 1".into()));
        }
        validate_retention(&self.retention.target)
    }
}

pub fn validate_retention(target: &RetentionTarget) -> Result<()> {
    if !(0.0..=100.0).contains(&target.min_free_percent) {
        return Err(Error::Config(format!(
            "min free percent must be within 0..=100, got {}",
            target.min_free_percent
        )));
    }
    if target.eligible_extensions.is_empty() {
        return Err(Error::Config("no eligible extensions for retention".into()));
    }
    Ok(())
}

/// `Duration` as seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// `Option<Duration>` as seconds or `null`.
pub mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
