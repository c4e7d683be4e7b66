//! Time sources.
//!
//! Expiry of TTL'd cells is judged against a monotonically supplied "now".
//! The clock is injected so tests can move time explicitly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, the unit of deletion and expiry times
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct GcTime(pub u32);

impl GcTime {
    pub const MAX: GcTime = GcTime(u32::MAX);

    pub fn plus_seconds(self, secs: u32) -> GcTime {
        GcTime(self.0.saturating_add(secs))
    }
}

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> GcTime;
}

/// Wall clock, clamped so it never runs backwards
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU32,
}

impl Clock for SystemClock {
    fn now(&self) -> GcTime {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        let prev = self.last.fetch_max(secs, Ordering::Relaxed);
        GcTime(prev.max(secs))
    }
}

/// Clock moved by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start: GcTime) -> Self {
        Self {
            now: AtomicU32::new(start.0),
        }
    }

    /// Move forward by `secs`
    pub fn advance(&self, secs: u32) {
        let _ = self
            .now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_add(secs)));
    }

    /// Jump to `to`; moving backward is ignored
    pub fn set(&self, to: GcTime) {
        self.now.fetch_max(to.0, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> GcTime {
        GcTime(self.now.load(Ordering::Relaxed))
    }
}
