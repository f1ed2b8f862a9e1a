use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use crate::{AdmissionDecision, QualifiedKey, TimeSource, WindowSizeMs};

/// Fixed-window QPS counter for a single key.
///
/// # Algorithm
///
/// 1. **Window:** `now_millis / window_size_ms`, so windows are aligned to the
///    time source's clock rather than to controller creation
/// 2. **Reset:** the first admission check in a newer window resets the count
/// 3. **Decision:** admit iff the count before incrementing is below the limit
///
/// A limit of `0` or less disables enforcement entirely.
///
/// # Thread Safety
///
/// The `(window, count)` pair lives in one [`AtomicU64`] (40 bits of window
/// index, 24 bits of count) and is updated with a compare-and-swap loop, so concurrent admissions can never both take the
/// last slot, and exactly one of the threads racing a window boundary performs
/// the reset. The limit is a separate atomic, stored independently by
/// configuration updates.
///
/// # Semantics & Limitations
///
/// **Boundary bursts:**
/// - Up to `2 × limit` calls can pass within one window length straddling a
///   boundary. This is the tradeoff for O(1) checks
///
/// **Limit changes:**
/// - [`set_limit`](Self::set_limit) does not reset the current count
/// - Lowering the limit mid-window can leave the window already over-admitted;
///   further calls are rejected until the next window
///
/// **Packed widths:**
/// - Limits above [`MAX_WINDOW_COUNT`] are capped to it
/// - The window index is stored modulo 2^40. Only a counter left idle for
///   2^39 windows or more (about 17 years at 1 ms windows) can mistake its
///   stored window for a newer one
pub struct QpsController {
    key: QualifiedKey,
    limit: AtomicI64,
    window_size_ms: WindowSizeMs,
    time_source: Arc<dyn TimeSource>,
    state: AtomicU64,
}

/// Point-in-time view of a [`QpsController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpsControllerState {
    /// Canonical key.
    pub key: String,
    /// Configured limit (`<= 0` means unlimited).
    pub limit: i64,
    /// Current window index (truncated to 40 bits).
    pub window: u64,
    /// Calls admitted in the current window.
    pub admitted: u32,
}

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const WINDOW_BITS: u32 = 64 - COUNT_BITS;
const WINDOW_MASK: u64 = (1 << WINDOW_BITS) - 1;

/// Largest per-window count the packed state can hold.
pub const MAX_WINDOW_COUNT: u32 = COUNT_MASK as u32;

#[inline]
fn window_index(now_millis: u64, window_size_ms: u64) -> u64 {
    (now_millis / window_size_ms) & WINDOW_MASK
}

#[inline]
fn pack(window: u64, count: u32) -> u64 {
    (window << COUNT_BITS) | u64::from(count)
}

#[inline]
fn unpack(state: u64) -> (u64, u32) {
    (state >> COUNT_BITS, (state & COUNT_MASK) as u32)
}

/// Count that applies in `window`, given the stored state.
///
/// The distance between the two indexes is read as a signed 40-bit value. A
/// stored window newer than `window` (a thread that read the clock just
/// before a racing thread moved past the boundary) keeps the stored state;
/// any older stored window resets.
#[inline]
fn effective(state: u64, window: u64) -> (u64, u32) {
    let (stored_window, count) = unpack(state);
    let distance = window.wrapping_sub(stored_window) & WINDOW_MASK;

    if distance != 0 && distance < (1 << (WINDOW_BITS - 1)) {
        (window, 0)
    } else {
        (stored_window, count)
    }
}

impl QpsController {
    /// Create a controller for `key` seeded with `limit`.
    pub fn new(
        key: QualifiedKey,
        limit: i64,
        window_size_ms: WindowSizeMs,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        let window = window_index(time_source.now_millis(), *window_size_ms);

        Self {
            key,
            limit: AtomicI64::new(limit),
            window_size_ms,
            time_source,
            state: AtomicU64::new(pack(window, 0)),
        }
    } // end constructor

    /// Key this controller counts calls for.
    pub fn key(&self) -> &QualifiedKey {
        &self.key
    }

    /// Current limit.
    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Replace the limit in place, keeping the current window's count.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Release);
    }

    fn current_window(&self) -> u64 {
        window_index(self.time_source.now_millis(), *self.window_size_ms)
    }

    fn ceiling(limit: i64) -> u32 {
        u32::try_from(limit).map_or(MAX_WINDOW_COUNT, |limit| limit.min(MAX_WINDOW_COUNT))
    }

    /// Admit one call if the current window has room.
    ///
    /// Returns `true` and records the call when admitted. A rejected call is
    /// not counted.
    pub fn try_admit(&self) -> bool {
        let limit = self.limit();
        if limit <= 0 {
            return true;
        }

        let ceiling = Self::ceiling(limit);
        let window = self.current_window();

        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let (window, count) = effective(state, window);
                (count < ceiling).then(|| pack(window, count + 1))
            })
            .is_ok()
    } // end method try_admit

    /// Whether the next admission check would currently reject.
    ///
    /// Read-only: no count is recorded and no window reset is installed.
    pub fn is_limit_new_request(&self) -> bool {
        let limit = self.limit();
        if limit <= 0 {
            return false;
        }

        let (_, count) = effective(self.state.load(Ordering::Acquire), self.current_window());

        count >= Self::ceiling(limit)
    }

    /// Admit one call, returning a decision with backoff hints on rejection.
    pub fn check(&self) -> AdmissionDecision {
        if self.try_admit() {
            return AdmissionDecision::Allowed;
        }

        let window_size_ms = *self.window_size_ms;
        let retry_after_ms = window_size_ms - self.time_source.now_millis() % window_size_ms;

        AdmissionDecision::Rejected {
            key: self.key.to_string(),
            limit: self.limit(),
            retry_after_ms,
        }
    }

    /// Snapshot of the controller's state as of now.
    pub fn state(&self) -> QpsControllerState {
        let (window, admitted) =
            effective(self.state.load(Ordering::Acquire), self.current_window());

        QpsControllerState {
            key: self.key.to_string(),
            limit: self.limit(),
            window,
            admitted,
        }
    }
} // end of impl

impl std::fmt::Debug for QpsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QpsController")
            .field("key", &self.key)
            .field("limit", &self.limit())
            .field("window_size_ms", &*self.window_size_ms)
            .finish()
    }
}
