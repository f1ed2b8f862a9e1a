use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of the current time, in milliseconds.
///
/// Fixed windows are computed as `now_millis() / window_size_ms`, so the
/// values returned must be non-decreasing for admission to be well behaved.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Wall clock time source (milliseconds since the Unix epoch).
///
/// Windows therefore start on wall-clock second boundaries with the default
/// window size.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Manually driven time source for tests and load harnesses.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_millis: AtomicU64,
}

impl ManualTimeSource {
    /// Create a time source frozen at `now_millis`.
    pub fn new(now_millis: u64) -> Self {
        Self {
            now_millis: AtomicU64::new(now_millis),
        }
    }

    /// Set the current time.
    pub fn set(&self, now_millis: u64) {
        self.now_millis.store(now_millis, Ordering::Release);
    }

    /// Move the current time forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now_millis.fetch_add(millis, Ordering::AcqRel);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now_millis.load(Ordering::Acquire)
    }
}
