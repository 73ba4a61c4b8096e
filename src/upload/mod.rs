//! Upload of finished segments to remote object storage.
//!
//! New files are reported by [`SegmentEvents`], deduplicated and bounded by
//! [`UploadQueue`], confirmed complete and transferred by [`Dispatcher`].

mod dispatcher;
mod events;
mod queue;
mod store;

pub use dispatcher::{
    DispatchConfig, Dispatcher, SegmentState, UploadFailure, UploadJob, UploadOutcome,
};
pub use events::SegmentEvents;
pub use queue::{QueueConfig, UploadQueue, UploadSummary, UploadWorkers};
pub use store::{LocalStore, ObjectStore};
#[cfg(feature = "http-store")]
pub use store::{HttpStore, HttpStoreConfig};
