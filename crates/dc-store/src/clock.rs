//! Epoch clock abstraction.
//!
//! Retry due times are absolute epoch seconds; the in-memory backend takes a
//! `Clock` so due-time behavior can be exercised without waiting on wall
//! time. Production code uses `SystemClock`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

/// Wall-clock epoch seconds.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A settable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    epoch: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch: i64) -> Arc<Self> {
        Arc::new(Self {
            epoch: AtomicI64::new(epoch),
        })
    }

    pub fn set(&self, epoch: i64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.epoch.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
