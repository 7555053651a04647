//! Primitives shared by the upload and query sessions: attempt tokens,
//! monotonic progress and poison-tolerant locking.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Identifies one transfer attempt. Later attempts always compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptToken(u64);

impl AttemptToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub(crate) struct AttemptCounter {
    last: u64,
}

impl AttemptCounter {
    pub(crate) fn issue(&mut self) -> AttemptToken {
        self.last += 1;
        AttemptToken(self.last)
    }
}

/// Fraction of a transfer that has completed, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Progress(f32);

impl Progress {
    pub const ZERO: Progress = Progress(0.0);
    pub const COMPLETE: Progress = Progress(1.0);

    pub fn new(fraction: f32) -> Self {
        if fraction.is_nan() {
            return Self::ZERO;
        }
        Progress(fraction.clamp(0.0, 1.0))
    }

    pub fn fraction(self) -> f32 {
        self.0
    }

    /// Rounded whole percent, for display.
    pub fn percent(self) -> u8 {
        (self.0 * 100.0).round() as u8
    }

    /// Move forward to `next`. Returns false, leaving the value alone, when
    /// `next` would go backwards.
    pub(crate) fn advance(&mut self, next: Progress) -> bool {
        if next < *self {
            return false;
        }
        *self = next;
        true
    }
}

/// State is only mutated inside short critical sections that cannot leave it
/// half-written, so a poisoned lock still holds consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
