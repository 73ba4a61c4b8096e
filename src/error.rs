use std::path::PathBuf;

use crate::supervisor::ExitKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to launch capture process: {0}")]
    Launch(String),

    #[error("capture process failed {attempts} times, retry budget exhausted (last exit: {last_exit})")]
    RetriesExhausted { attempts: u32, last_exit: ExitKind },

    #[error("segment name does not follow the naming convention: {0}")]
    UnparseableName(String),

    #[error("object store transfer failed for {}: {reason}", path.display())]
    Store { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
