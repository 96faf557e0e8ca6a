//! Shared identifiers and time sources.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric application id.
pub type Uid = u32;

/// Operation identifier.
pub type OpCode = u32;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Execution context of an app at the time an op was noted.
///
/// Ordered from most to least important, matching how states are listed in
/// dumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UidState {
    Persistent,
    Top,
    ForegroundService,
    Foreground,
    Background,
    Cached,
}

impl UidState {
    pub const ALL: [UidState; 6] = [
        UidState::Persistent,
        UidState::Top,
        UidState::ForegroundService,
        UidState::Foreground,
        UidState::Background,
        UidState::Cached,
    ];

    /// Short label used in dumps
    pub const fn label(self) -> &'static str {
        match self {
            Self::Persistent => "pers",
            Self::Top => "top",
            Self::ForegroundService => "fgsvc",
            Self::Foreground => "fg",
            Self::Background => "bg",
            Self::Cached => "cch",
        }
    }
}

/// Source of "now" for the registry.
///
/// Everything that reads the clock goes through this trait so tests can
/// move time explicitly, including backwards.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        now_ms()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move the clock by `delta_ms` (negative moves it back).
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
