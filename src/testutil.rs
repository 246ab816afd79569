//! Shared helpers for the crate's tests.

use crate::time::{Instant, TimeSource};

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

/// A manually advanced time source.
///
/// Most tests use 1 GHz (`khz = 1_000_000`) so one guest-time cycle equals
/// one nanosecond.
pub struct ManualClock {
    ns: AtomicU64,
    khz: u64,
}

impl ManualClock {
    pub fn new(khz: u64) -> Arc<Self> {
        Arc::new(ManualClock {
            ns: AtomicU64::new(0),
            khz,
        })
    }

    pub fn advance(&self, d: Duration) {
        self.ns.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Instant {
        Instant(self.ns.load(Ordering::SeqCst))
    }

    fn cpu_khz(&self) -> u64 {
        self.khz
    }
}
