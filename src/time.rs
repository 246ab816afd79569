#![deny(missing_docs)]

//! # Abstract time support
//!
//! This module contains the system clock abstraction and the host timer
//! facility. A `Clock` wraps a monotonic `TimeSource`; `HostTimers` multiplexes
//! any number of one-shot software timers onto it, one wheel per physical
//! core. A `HostTimer` is armed with an absolute deadline and invokes its
//! callback from whichever core's wheel currently services it.

use crate::error::Result;
use crate::lock;
use crate::percore::CoreId;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use spin::Mutex;

/// The maximum number of physical cores a `HostTimers` instance can service.
pub const MAX_HOST_CORES: usize = 32;

/// A point in time on the system in nanoseconds since an arbitrary epoch
///
/// An `Instant` can be added/subtracted with a `Duration` to produce an
/// `Instant` in the future or past.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Instant(pub u64);

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, other: Duration) -> Self {
        Instant(self.0 + other.as_nanos() as u64)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, other: Duration) -> Self {
        Instant(self.0 - other.as_nanos() as u64)
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, other: Self) -> Duration {
        let ns = (self.0 as i128 - other.0 as i128).abs() as u64;
        Duration::from_nanos(ns)
    }
}

/// A trait representing a monotonic counter on the system.
pub trait TimeSource: Send + Sync {
    /// The current value of the counter.
    fn now(&self) -> Instant;

    /// The frequency of the CPU serviced by this counter, in kHz.
    ///
    /// Guest-visible time is stamped in CPU cycles at this rate.
    fn cpu_khz(&self) -> u64;
}

/// A shareable handle to the system `TimeSource`
#[derive(Clone)]
pub struct Clock(Arc<dyn TimeSource>);

impl Clock {
    /// Create a clock from the given time source.
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Clock(source)
    }

    /// Get the current instant.
    pub fn now(&self) -> Instant {
        self.0.now()
    }

    /// The CPU frequency backing guest-visible time, in kHz.
    pub fn cpu_khz(&self) -> u64 {
        self.0.cpu_khz()
    }

    /// Guest-time units (CPU cycles) elapsed at `at`.
    pub fn cycles_at(&self, at: Instant) -> u64 {
        (at.0 as u128 * self.cpu_khz() as u128 / 1_000_000) as u64
    }

    /// Guest-time units (CPU cycles) spanned by `duration`.
    pub fn cycles_in(&self, duration: Duration) -> u64 {
        (duration.as_nanos() * self.cpu_khz() as u128 / 1_000_000) as u64
    }
}

/// Callback invoked when a `HostTimer` expires.
pub type TimerHandler = Box<dyn Fn() + Send + Sync>;

// A deadline of zero doubles as "disarmed", so armed deadlines are clamped
// to at least 1ns.
struct TimerEntry {
    cpu: AtomicU32,
    deadline: AtomicU64,
    running: AtomicBool,
    killed: AtomicBool,
    handler: TimerHandler,
}

impl TimerEntry {
    fn cpu(&self) -> CoreId {
        CoreId::from(self.cpu.load(Ordering::SeqCst))
    }
}

/// A one-shot timer serviced by a `HostTimers` wheel
///
/// The timer stays bound to one physical core until `migrate` rebinds it.
/// Dropping the handle disarms the timer but does not wait for an in-flight
/// callback; use `kill` for synchronous teardown.
pub struct HostTimer {
    host: Arc<HostTimers>,
    entry: Arc<TimerEntry>,
}

impl HostTimer {
    /// Arm the timer to fire at the absolute time `deadline`.
    ///
    /// Re-arming an already armed timer moves its deadline. Arming a killed
    /// timer has no effect.
    pub fn set(&self, deadline: Instant) {
        if self.entry.killed.load(Ordering::SeqCst) {
            return;
        }
        let mut wheel = self.host.wheel(self.entry.cpu()).lock();
        self.entry.deadline.store(deadline.0.max(1), Ordering::SeqCst);
        if !wheel.armed.iter().any(|e| Arc::ptr_eq(e, &self.entry)) {
            wheel.armed.push(self.entry.clone());
        }
    }

    /// Disarm the timer. Does not wait for an in-flight callback.
    pub fn stop(&self) {
        self.remove_from_wheel();
    }

    /// Rebind the timer to a new physical core, preserving its deadline.
    pub fn migrate(&self, cpu: CoreId) {
        if self.entry.killed.load(Ordering::SeqCst) {
            return;
        }
        assert!((cpu.raw as usize) < self.host.wheels.len());
        loop {
            let old = self.entry.cpu();
            let (first, second) = if old.raw <= cpu.raw {
                (old, cpu)
            } else {
                (cpu, old)
            };
            let mut first_wheel = self.host.wheel(first).lock();
            let mut second_wheel = if first == second {
                None
            } else {
                Some(self.host.wheel(second).lock())
            };
            if self.entry.cpu() != old {
                continue;
            }
            {
                let old_wheel: &mut TimerWheel = if old == first {
                    &mut *first_wheel
                } else {
                    &mut **second_wheel
                        .as_mut()
                        .expect("old wheel must be locked")
                };
                old_wheel.armed.retain(|e| !Arc::ptr_eq(e, &self.entry));
            }
            self.entry.cpu.store(cpu.raw, Ordering::SeqCst);
            if self.entry.deadline.load(Ordering::SeqCst) != 0 {
                let new_wheel: &mut TimerWheel = if cpu == first {
                    &mut *first_wheel
                } else {
                    &mut **second_wheel
                        .as_mut()
                        .expect("new wheel must be locked")
                };
                new_wheel.armed.push(self.entry.clone());
            }
            return;
        }
    }

    /// Disarm the timer and wait for any in-flight callback to complete.
    ///
    /// After `kill` returns the callback will never run again. Must not be
    /// called while holding any lock the callback acquires.
    pub fn kill(self) {
        self.entry.killed.store(true, Ordering::SeqCst);
        self.remove_from_wheel();
        while self.entry.running.load(Ordering::SeqCst) {
            lock::relax_cpu();
        }
        // The callback may have re-armed itself concurrently with the
        // removal above; it cannot any longer, so one more pass leaves the
        // wheel clean.
        self.remove_from_wheel();
    }

    fn remove_from_wheel(&self) {
        loop {
            let cpu = self.entry.cpu();
            let mut wheel = self.host.wheel(cpu).lock();
            if self.entry.cpu() != cpu {
                continue;
            }
            wheel.armed.retain(|e| !Arc::ptr_eq(e, &self.entry));
            self.entry.deadline.store(0, Ordering::SeqCst);
            return;
        }
    }
}

impl Drop for HostTimer {
    fn drop(&mut self) {
        self.remove_from_wheel();
    }
}

#[derive(Default)]
struct TimerWheel {
    armed: Vec<Arc<TimerEntry>>,
}

/// The per-core software timer wheels of the host
///
/// Each wheel multiplexes the timers bound to one physical core onto that
/// core's hardware timer interrupt: the embedder calls `expire_elapsed` from
/// the interrupt path and callbacks run there, so a callback may execute
/// concurrently with anything running on other cores.
pub struct HostTimers {
    clock: Clock,
    wheels: ArrayVec<[Mutex<TimerWheel>; MAX_HOST_CORES]>,
}

impl HostTimers {
    /// Create wheels for `ncores` physical cores driven by `clock`.
    pub fn new(clock: Clock, ncores: usize) -> Result<Arc<Self>> {
        let mut wheels = ArrayVec::new();
        for _ in 0..ncores {
            wheels.try_push(Mutex::new(TimerWheel::default()))?;
        }
        Ok(Arc::new(HostTimers { clock, wheels }))
    }

    /// The clock driving these wheels.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Create a disarmed timer bound to `cpu` that runs `handler` on expiry.
    pub fn init_timer(
        self: &Arc<Self>,
        cpu: CoreId,
        handler: TimerHandler,
    ) -> HostTimer {
        assert!((cpu.raw as usize) < self.wheels.len());
        HostTimer {
            host: self.clone(),
            entry: Arc::new(TimerEntry {
                cpu: AtomicU32::new(cpu.raw),
                deadline: AtomicU64::new(0),
                running: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                handler,
            }),
        }
    }

    /// Run the callbacks of every timer on `cpu`'s wheel whose deadline has
    /// passed. Callbacks run with the wheel lock dropped.
    pub fn expire_elapsed(&self, cpu: CoreId) {
        let now = self.clock.now();
        let due = {
            let mut wheel = self.wheel(cpu).lock();
            let mut due = vec![];
            wheel.armed.retain(|entry| {
                let deadline = entry.deadline.load(Ordering::SeqCst);
                if deadline != 0 && deadline <= now.0 {
                    entry.deadline.store(0, Ordering::SeqCst);
                    // Marked under the wheel lock, so `kill` either removes
                    // the entry first or observes the callback in flight.
                    entry.running.store(true, Ordering::SeqCst);
                    due.push(entry.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        for entry in due {
            if !entry.killed.load(Ordering::SeqCst) {
                (entry.handler)();
            }
            entry.running.store(false, Ordering::SeqCst);
        }
    }

    fn wheel(&self, cpu: CoreId) -> &Mutex<TimerWheel> {
        &self.wheels[cpu.raw as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::ManualClock;
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    fn counting_host() -> (Arc<ManualClock>, Arc<HostTimers>) {
        let source = ManualClock::new(1_000_000);
        let clock = Clock::new(source.clone());
        (source, HostTimers::new(clock, 2).unwrap())
    }

    #[test]
    fn test_instant_duration_math() {
        let t = Instant(1_000);
        assert_eq!(t + Duration::from_nanos(500), Instant(1_500));
        assert_eq!(t - Duration::from_nanos(500), Instant(500));
        assert_eq!(Instant(3_000) - Instant(1_000), Duration::from_nanos(2_000));
    }

    #[test]
    fn test_oneshot_fires_once() {
        let (source, host) = counting_host();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let timer = host.init_timer(
            CoreId::from(0),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        timer.set(Instant(1_000));
        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        source.advance(Duration::from_nanos(1_000));
        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A fired timer is disarmed until set again
        source.advance(Duration::from_nanos(10_000));
        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_disarms() {
        let (source, host) = counting_host();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let timer = host.init_timer(
            CoreId::from(0),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        timer.set(Instant(1_000));
        timer.stop();
        source.advance(Duration::from_nanos(2_000));
        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_migrate_moves_servicing_core() {
        let (source, host) = counting_host();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let timer = host.init_timer(
            CoreId::from(0),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        timer.set(Instant(1_000));
        timer.migrate(CoreId::from(1));
        source.advance(Duration::from_nanos(2_000));

        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        host.expire_elapsed(CoreId::from(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kill_waits_for_inflight_callback() {
        let (source, host) = counting_host();
        let entered = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let handler_entered = entered.clone();
        let handler_release = release.clone();
        let timer = host.init_timer(
            CoreId::from(0),
            Box::new(move || {
                handler_entered.store(true, Ordering::SeqCst);
                while !handler_release.load(Ordering::SeqCst) {
                    lock::relax_cpu();
                }
            }),
        );

        timer.set(Instant(1_000));
        source.advance(Duration::from_nanos(1_000));

        let expire_host = host.clone();
        let expirer =
            thread::spawn(move || expire_host.expire_elapsed(CoreId::from(0)));

        while !entered.load(Ordering::SeqCst) {
            lock::relax_cpu();
        }

        let killed = Arc::new(AtomicBool::new(false));
        let kill_done = killed.clone();
        let killer = thread::spawn(move || {
            timer.kill();
            kill_done.store(true, Ordering::SeqCst);
        });

        // The callback has not returned, so the kill must still be blocked
        thread::sleep(core::time::Duration::from_millis(20));
        assert_eq!(killed.load(Ordering::SeqCst), false);

        release.store(true, Ordering::SeqCst);
        expirer.join().unwrap();
        killer.join().unwrap();
        assert_eq!(killed.load(Ordering::SeqCst), true);
    }

    #[test]
    fn test_killed_timer_never_rearms() {
        let (source, host) = counting_host();
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let timer = host.init_timer(
            CoreId::from(0),
            Box::new(move || {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        timer.set(Instant(1_000));
        timer.kill();
        source.advance(Duration::from_nanos(5_000));
        host.expire_elapsed(CoreId::from(0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
