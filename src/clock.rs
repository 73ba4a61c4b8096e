use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime, UtcOffset};

use crate::naming::DayKey;

/// A source of wall-clock time for naming and day-rollover decisions.
///
/// The supervisor never reads the system clock directly, so tests can move
/// time across midnight without sleeping.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current local time.
    fn now(&self) -> OffsetDateTime;

    /// Returns the calendar day the current local time falls on.
    fn day_key(&self) -> DayKey {
        DayKey::from_datetime(self.now())
    }
}

/// A clock backed by `SystemTime`, shifted to a fixed UTC offset.
///
/// The offset is resolved once at construction. On Unix the local offset can
/// only be read reliably while the process is single-threaded, so build this
/// before starting the async runtime.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Resolves the host's local offset, falling back to UTC.
    pub fn local() -> Self {
        match UtcOffset::current_local_offset() {
            Ok(offset) => Self { offset },
            Err(err) => {
                log::warn!("could not determine local UTC offset ({err}); using UTC");
                Self { offset: UtcOffset::UTC }
            }
        }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(UtcOffset::UTC)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OffsetDateTime> {
        // A poisoned lock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.lock()
    }
}
