//! Time source
//!
//! Every timestamp the core records or compares goes through a `Clock`, so
//! tests can run the whole engine on virtual time.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Issues strictly increasing local timestamps from a clock
///
/// A clock that steps backwards (NTP correction, manual change) never
/// produces a stamp older than one already issued.
#[derive(Debug, Default)]
pub struct Stamper {
    last: u64,
}

impl Stamper {
    /// Resume after the newest stamp seen in persisted state
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn next(&mut self, clock: &dyn Clock) -> u64 {
        let now = clock.now_ms();
        self.last = if now > self.last { now } else { self.last + 1 };
        self.last
    }
}
