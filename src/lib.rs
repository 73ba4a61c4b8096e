//! Unattended stream recorder.
//!
//! Keeps an external capture process writing day-labelled segment files,
//! uploads each finished segment to object storage, and deletes the oldest
//! segments when the disk runs short of free space.

pub mod clock;
pub mod config;
pub mod error;
pub mod naming;
pub mod retention;
pub mod shutdown;
pub mod supervisor;
pub mod upload;
pub mod watcher;

pub use error::{Error, Result};
