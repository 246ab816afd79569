//! # Virtual platform timers
//!
//! Each guest CPU owns a set of `PeriodicTime` records emulating the
//! platform's periodic (or one-shot) interrupt sources. Expiry is driven by
//! the host clock through a `HostTimer`, but delivery is gated on the guest
//! being runnable, the emulated interrupt controllers not masking the line,
//! and the guest acknowledging the previous tick. The per-VM `TimerMode`
//! selects how ticks that elapsed while the guest CPU was off a physical
//! core are compensated.
//!
//! All per-record state is protected by the owning guest CPU's timer lock.
//! Because a record's owner can change across a destroy/re-create, the lock
//! is acquired with a retry loop (`pt_lock`) that re-checks ownership after
//! the acquisition.

use crate::time::Instant;
use crate::vcpu::{Vcpu, VcpuTimers};
use crate::vm;

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::time::Duration;
use serde::Deserialize;
use spin::Mutex;

/// Periodic timers programmed shorter than this are stretched to it.
pub const MIN_PERIOD: Duration = Duration::from_nanos(900_000);

/// How ticks missed while a guest CPU was descheduled are compensated
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    /// Stall guest-visible time while the guest CPU is descheduled, so the
    /// guest never observes a gap and no ticks accumulate.
    DelayForMissedTicks,
    /// Never hold more than one tick pending; later ticks run at real time.
    NoMissedTicksPending,
    /// Accumulate missed ticks but collapse them into one on acknowledge.
    OneMissedTickPending,
    /// Deliver every missed tick individually, as fast as the guest acks.
    NoDelay,
}

impl Default for TimerMode {
    fn default() -> Self {
        TimerMode::NoDelay
    }
}

/// The emulated controller a timer's line assertion is delivered through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtSource {
    /// Injected directly into the guest CPU's virtual local APIC
    Lapic,
    /// An ISA IRQ, routed through the virtual PIC and I/O APIC
    Isa,
}

/// The controller through which the guest acknowledged a vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntSource {
    /// Acknowledged on the virtual PIC path
    Pic,
    /// Acknowledged on the virtual local APIC path
    Lapic,
}

/// A guest-acknowledged interrupt, as seen by the injection path
#[derive(Clone, Copy, Debug)]
pub struct IntAck {
    /// The acknowledged vector
    pub vector: u8,
    /// The controller it was acknowledged through
    pub source: IntSource,
}

/// Post-acknowledge callback, invoked with the timer lock dropped.
pub type TimeCallback = Arc<dyn Fn(&Vcpu) + Send + Sync>;

pub(crate) struct PtState {
    pub(crate) irq: u8,
    pub(crate) period: Duration,
    pub(crate) period_cycles: u64,
    pub(crate) one_shot: bool,
    pub(crate) scheduled: Instant,
    pub(crate) last_plt_gtime: u64,
    pub(crate) pending_intr_nr: u32,
    pub(crate) irq_issued: bool,
    pub(crate) do_not_freeze: bool,
    pub(crate) on_list: bool,
    pub(crate) timer: Option<crate::time::HostTimer>,
    pub(crate) cb: Option<TimeCallback>,
}

/// One emulated platform timer, bound to a single guest CPU
///
/// The record's storage belongs to the device model that programs it; this
/// module owns only the list linkage, the host-timer handle and the interior
/// state. `source` is fixed at construction and selects the delivery path.
pub struct PeriodicTime {
    source: PtSource,
    owner: Mutex<Option<Arc<Vcpu>>>,
    state: UnsafeCell<PtState>,
}

// The interior state is only ever accessed while holding the timer lock of
// the vcpu in `owner` (see `pt_lock`), or before the record is first linked.
unsafe impl Send for PeriodicTime {}
unsafe impl Sync for PeriodicTime {}

impl PeriodicTime {
    /// Create an unlinked record delivering through `source`.
    pub fn new(source: PtSource) -> Arc<Self> {
        Arc::new(PeriodicTime {
            source,
            owner: Mutex::new(None),
            state: UnsafeCell::new(PtState {
                irq: 0,
                period: Duration::from_nanos(0),
                period_cycles: 0,
                one_shot: false,
                scheduled: Instant(0),
                last_plt_gtime: 0,
                pending_intr_nr: 0,
                irq_issued: false,
                do_not_freeze: false,
                on_list: false,
                timer: None,
                cb: None,
            }),
        })
    }

    /// The delivery path this timer was created for.
    pub fn source(&self) -> PtSource {
        self.source
    }

    // Caller must hold the timer lock of the vcpu that currently owns this
    // record, or be initializing a record no other context can reach.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_mut(&self) -> &mut PtState {
        &mut *self.state.get()
    }
}

/// Run `f` under the timer lock of the record's current owner.
///
/// The owner is re-read after the lock is taken; if a concurrent re-create
/// moved the record to another vcpu the acquisition is retried. Returns
/// `None` if the record was never linked to a vcpu.
pub(crate) fn pt_lock<R>(
    pt: &PeriodicTime,
    f: impl FnOnce(&Arc<Vcpu>, &mut VcpuTimers, &mut PtState) -> R,
) -> Option<R> {
    loop {
        let v = match pt.owner.lock().clone() {
            Some(v) => v,
            None => return None,
        };
        let mut tm = v.tm.lock();
        let unchanged = pt
            .owner
            .lock()
            .as_ref()
            .map_or(false, |cur| Arc::ptr_eq(cur, &v));
        if unchanged {
            let state = unsafe { pt.state_mut() };
            return Some(f(&v, &mut tm, state));
        }
        drop(tm);
    }
}

/// Apply the configured tick-accounting mode to a timer the host clock has
/// overtaken, advancing `scheduled` past `now`.
fn pt_process_missed_ticks(v: &Vcpu, s: &mut PtState) {
    if s.one_shot {
        return;
    }

    let now = v.vm.clock().now();
    if now.0 <= s.scheduled.0 {
        return;
    }

    let period = s.period.as_nanos() as u64;
    let missed = (now.0 - s.scheduled.0) / period + 1;
    match v.vm.timer_mode() {
        TimerMode::DelayForMissedTicks => {
            // Guest time is stalled across the deschedule instead; the
            // freeze/thaw pair hides the gap from the guest.
        }
        TimerMode::NoMissedTicksPending => {
            s.do_not_freeze = s.pending_intr_nr == 0;
        }
        TimerMode::OneMissedTickPending | TimerMode::NoDelay => {
            s.pending_intr_nr = s.pending_intr_nr.saturating_add(missed as u32);
        }
    }
    s.scheduled.0 += missed * period;
}

fn pt_freeze_time(v: &Vcpu, tm: &mut VcpuTimers) {
    if v.vm.timer_mode() != TimerMode::DelayForMissedTicks {
        return;
    }
    tm.guest_time = v.guest_time();
}

fn pt_thaw_time(v: &Vcpu, tm: &mut VcpuTimers) {
    if v.vm.timer_mode() != TimerMode::DelayForMissedTicks {
        return;
    }
    if tm.guest_time == 0 {
        return;
    }
    v.set_guest_time(tm.guest_time);
    tm.guest_time = 0;
}

/// Host-timer expiry callback. May run on any physical core, concurrently
/// with the owning vcpu executing elsewhere.
fn pt_timer_fn(pt: &PeriodicTime) {
    pt_lock(pt, |v, _tm, s| {
        s.pending_intr_nr = s.pending_intr_nr.saturating_add(1);

        if !s.one_shot {
            s.scheduled += s.period;
            pt_process_missed_ticks(v, s);
            if let Some(timer) = &s.timer {
                timer.set(s.scheduled);
            }
        }

        v.kick();
    });
}

fn pt_irq_masked(v: &Vcpu, pt: &PeriodicTime, s: &PtState) -> bool {
    match pt.source {
        PtSource::Lapic => !v.lapic.enabled() || v.lapic.timer_masked(),
        PtSource::Isa => {
            // An ISA interrupt can reach the guest through the PIC or
            // through the I/O APIC; it is only dead if both routes are.
            let isa_irq = s.irq;
            let gsi = vm::isa_irq_to_gsi(isa_irq);
            let pic_route_closed = v.vm.pic().read().is_masked(isa_irq)
                || !v.lapic.accept_pic_intr();
            pic_route_closed && v.vm.ioapic().entry_masked(gsi)
        }
    }
}

fn pt_irq_vector(v: &Vcpu, pt: &PeriodicTime, s: &PtState, src: IntSource) -> u8 {
    match pt.source {
        PtSource::Lapic => s.irq,
        PtSource::Isa => {
            let isa_irq = s.irq;
            match src {
                IntSource::Pic => v.vm.pic().read().vector_for(isa_irq),
                IntSource::Lapic => {
                    v.vm.ioapic().entry_vector(vm::isa_irq_to_gsi(isa_irq))
                }
            }
        }
    }
}

/// Stop the guest CPU's timers before it yields its physical core.
///
/// A blocked vcpu keeps its timers running so an expiry can wake it; only a
/// runnable-but-preempted vcpu is frozen here.
pub fn pt_save_timer(v: &Vcpu) {
    if v.is_blocked() {
        return;
    }

    let mut tm = v.tm.lock();
    for pt in tm.list.iter() {
        let s = unsafe { pt.state_mut() };
        if !s.do_not_freeze {
            if let Some(timer) = &s.timer {
                timer.stop();
            }
        }
    }
    pt_freeze_time(v, &mut tm);
}

/// Catch the guest CPU's timers up before it resumes on a physical core.
pub fn pt_restore_timer(v: &Vcpu) {
    let mut tm = v.tm.lock();
    for pt in tm.list.iter() {
        let s = unsafe { pt.state_mut() };
        pt_process_missed_ticks(v, s);
        if let Some(timer) = &s.timer {
            timer.set(s.scheduled);
        }
    }
    pt_thaw_time(v, &mut tm);
}

/// Select and assert at most one pending timer interrupt.
///
/// Among the unmasked records with pending ticks, the one furthest behind on
/// its guest-time schedule wins. Called on the vcpu itself, on the way back
/// into the guest.
pub fn pt_update_irq(v: &Vcpu) {
    let mut max_lag = u64::MAX;
    let mut earliest: Option<Arc<PeriodicTime>> = None;

    let tm = v.tm.lock();
    for pt in tm.list.iter() {
        let s = unsafe { pt.state_mut() };
        if s.pending_intr_nr > 0 && !pt_irq_masked(v, pt, s) {
            let lag = s.last_plt_gtime + s.period_cycles;
            if lag < max_lag {
                max_lag = lag;
                earliest = Some(pt.clone());
            }
        }
    }

    let pt = match earliest {
        Some(pt) => pt,
        None => return,
    };

    let (irq, source) = {
        let s = unsafe { pt.state_mut() };
        s.irq_issued = true;
        (s.irq, pt.source)
    };
    drop(tm);

    match source {
        PtSource::Lapic => v.lapic.set_irq(irq),
        PtSource::Isa => {
            // The emulated 8259 input is level sensitive; without the
            // intervening deassert a back-to-back assertion is collapsed.
            v.vm.isa_irq_deassert(irq);
            v.vm.isa_irq_assert(irq);
        }
    }
}

/// Reconcile timer state after the guest acknowledged `ack`.
///
/// Vectors that match no issuing timer belong to some other device and are
/// ignored. One-shot timers unlink themselves here; periodic ones retire a
/// tick (or collapse all of them, depending on the mode).
pub fn pt_intr_post(v: &Vcpu, ack: IntAck) {
    let mut tm = v.tm.lock();

    let idx = tm.list.iter().position(|pt| {
        let s = unsafe { pt.state_mut() };
        s.pending_intr_nr > 0
            && s.irq_issued
            && ack.vector == pt_irq_vector(v, pt, s, ack.source)
    });
    let idx = match idx {
        Some(idx) => idx,
        None => return,
    };
    let pt = tm.list[idx].clone();
    let s = unsafe { pt.state_mut() };

    s.do_not_freeze = false;
    s.irq_issued = false;

    if s.one_shot {
        tm.list.remove(idx);
        s.on_list = false;
    } else if v.vm.timer_mode() == TimerMode::OneMissedTickPending {
        s.last_plt_gtime = v.guest_time();
        s.pending_intr_nr = 0;
    } else {
        s.last_plt_gtime += s.period_cycles;
        s.pending_intr_nr -= 1;
    }

    if v.vm.timer_mode() == TimerMode::DelayForMissedTicks
        && v.guest_time() < s.last_plt_gtime
    {
        // We were holding guest time back; let it catch up to the tick the
        // guest just observed.
        v.set_guest_time(s.last_plt_gtime);
    }

    let cb = s.cb.clone();
    drop(tm);

    if let Some(cb) = cb {
        cb(v);
    }
}

/// Program `pt` as a timer of `v`, replacing any previous programming.
///
/// `irq` is a guest vector for LAPIC-source records and an ISA IRQ (0-15)
/// otherwise. The record is linked into `v`'s timer list and its host timer
/// is armed on `v`'s current physical core. `cb`, if any, runs after each
/// guest acknowledge.
pub fn create_periodic_time(
    v: &Arc<Vcpu>,
    pt: &Arc<PeriodicTime>,
    period: Duration,
    irq: u8,
    one_shot: bool,
    cb: Option<TimeCallback>,
) {
    destroy_periodic_time(pt);

    let mut period = period;
    if period < MIN_PERIOD && !one_shot {
        warn!(
            "clamping short platform timer period {}ns to {}ns",
            period.as_nanos(),
            MIN_PERIOD.as_nanos()
        );
        period = MIN_PERIOD;
    }

    let clock = v.vm.clock().clone();
    let mut tm = v.tm.lock();
    *pt.owner.lock() = Some(v.clone());

    let s = unsafe { pt.state_mut() };
    s.pending_intr_nr = 0;
    s.do_not_freeze = false;
    s.irq_issued = false;
    s.irq = irq;
    s.period = period;
    s.period_cycles = clock.cycles_in(period);
    s.one_shot = one_shot;
    s.last_plt_gtime = v.guest_time();
    s.scheduled = clock.now() + period;
    if pt.source == PtSource::Lapic {
        // Offset LAPIC expiries from the other tick sources, so guests that
        // do per-tick process accounting don't blame every LAPIC tick on
        // the PIT handler that happens to be running.
        s.scheduled += period / 2;
    }
    s.cb = cb;
    s.on_list = true;
    tm.list.push(pt.clone());

    let weak = Arc::downgrade(pt);
    let timer = v.vm.host().init_timer(
        v.processor(),
        alloc::boxed::Box::new(move || {
            if let Some(pt) = weak.upgrade() {
                pt_timer_fn(&pt);
            }
        }),
    );
    timer.set(s.scheduled);
    s.timer = Some(timer);
}

/// Unlink `pt` and synchronously tear down its host timer.
///
/// A record that was never created is ignored. After this returns, the
/// expiry callback will never run for this record again.
pub fn destroy_periodic_time(pt: &PeriodicTime) {
    let timer = match pt_lock(pt, |_v, tm, s| {
        if s.on_list {
            tm.unlink(pt);
        }
        s.on_list = false;
        s.timer.take()
    }) {
        Some(timer) => timer,
        None => return,
    };

    // The expiry callback can run until the kill completes and it takes the
    // same per-vcpu lock, so the wait must happen with the lock dropped.
    if let Some(timer) = timer {
        timer.kill();
    }
}

/// Restart every timer of `v` from now, dropping pending ticks (guest reset).
pub fn pt_reset(v: &Vcpu) {
    let tm = v.tm.lock();
    for pt in tm.list.iter() {
        let s = unsafe { pt.state_mut() };
        s.pending_intr_nr = 0;
        s.irq_issued = false;
        s.last_plt_gtime = v.guest_time();
        s.scheduled = v.vm.clock().now() + s.period;
        if let Some(timer) = &s.timer {
            timer.set(s.scheduled);
        }
    }
}

/// Rebind every host timer of `v` to its current physical core.
///
/// Called after the scheduler moved the vcpu; the records' owner does not
/// change, only which core services the expiry callbacks.
pub fn pt_migrate(v: &Vcpu) {
    let tm = v.tm.lock();
    for pt in tm.list.iter() {
        let s = unsafe { pt.state_mut() };
        if let Some(timer) = &s.timer {
            timer.migrate(v.processor());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::UserVmConfig;
    use crate::percore::CoreId;
    use crate::testutil::ManualClock;
    use crate::time::{Clock, HostTimers};
    use crate::vcpu::Vcpu;
    use crate::virtdev::ioapic::{DeliveryMode, IoRedTblEntry, TriggerMode};
    use crate::virtdev::{DeviceEvent, PortWriteRequest};
    use crate::vm::VirtualMachine;
    use core::convert::TryFrom;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const MS: Duration = Duration::from_millis(1);

    struct TestGuest {
        clock: Arc<ManualClock>,
        host: Arc<HostTimers>,
        vm: Arc<VirtualMachine>,
        vcpu: Arc<Vcpu>,
    }

    fn guest(mode: TimerMode) -> TestGuest {
        // 1 GHz, so guest-time cycles equal nanoseconds
        let clock = ManualClock::new(1_000_000);
        let host =
            HostTimers::new(Clock::new(clock.clone()), 2).unwrap();
        let config = UserVmConfig {
            cpus: vec![CoreId::from(0)],
            timer_mode: mode,
        };
        let vm = VirtualMachine::new(0, config, host.clone()).unwrap();
        let vcpu = Vcpu::new(&vm, 0, CoreId::from(0));
        TestGuest {
            clock,
            host,
            vm,
            vcpu,
        }
    }

    // Hardware-enable the virtual local APIC, software-enable it through
    // the spurious vector register and unmask the timer LVT
    fn enable_lapic(v: &Arc<Vcpu>) {
        v.lapic
            .set_apic_base(0xfee0_0000 | crate::virtdev::lapic::APIC_BASE_ENABLE);
        v.lapic.register_write(v, 0xf0, 0x1ff).unwrap();
        v.lapic.register_write(v, 0x320, 0x00).unwrap();
    }

    fn outb(vm: &VirtualMachine, port: u16, val: u8) {
        let data = [val];
        let req = PortWriteRequest::try_from(&data[..]).unwrap();
        vm.dispatch_event(port, DeviceEvent::PortWrite(port, req))
            .unwrap();
    }

    // Program the master 8259 so ISA IRQs 0-7 map to vectors 0x08-0x0f
    fn program_pic(vm: &VirtualMachine) {
        outb(vm, 0x20, 0x11);
        outb(vm, 0x21, 0x08);
    }

    fn pending(pt: &PeriodicTime) -> u32 {
        pt_lock(pt, |_, _, s| s.pending_intr_nr).unwrap()
    }

    fn scheduled(pt: &PeriodicTime) -> u64 {
        pt_lock(pt, |_, _, s| s.scheduled.0).unwrap()
    }

    #[test]
    fn test_simple_periodic_accumulates_ticks() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        assert_eq!(scheduled(&pt), 1_000_000);

        for _ in 0..3 {
            g.clock.advance(MS);
            g.host.expire_elapsed(CoreId::from(0));
        }
        g.clock.advance(MS / 2);
        g.host.expire_elapsed(CoreId::from(0));

        assert_eq!(pending(&pt), 3);
        assert_eq!(scheduled(&pt), 4_000_000);
        assert!(g.vcpu.take_kick());
    }

    #[test]
    fn test_deschedule_default_mode_accumulates() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.clock.advance(Duration::from_micros(200));
        pt_save_timer(&g.vcpu);

        g.clock.set_ns(5_700_000);
        pt_restore_timer(&g.vcpu);

        assert_eq!(pending(&pt), 5);
        assert_eq!(scheduled(&pt), 6_000_000);

        // The host timer really is armed at the advanced deadline
        g.clock.set_ns(6_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 6);
    }

    #[test]
    fn test_deschedule_no_missed_ticks_pending() {
        let g = guest(TimerMode::NoMissedTicksPending);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.clock.advance(Duration::from_micros(200));
        pt_save_timer(&g.vcpu);
        g.clock.set_ns(5_700_000);
        pt_restore_timer(&g.vcpu);

        assert_eq!(pending(&pt), 0);
        assert_eq!(scheduled(&pt), 6_000_000);
        assert!(pt_lock(&pt, |_, _, s| s.do_not_freeze).unwrap());

        g.clock.set_ns(6_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 1);

        pt_update_irq(&g.vcpu);
        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x08,
                source: IntSource::Pic,
            },
        );
        assert_eq!(pending(&pt), 0);
    }

    #[test]
    fn test_deschedule_one_missed_tick_pending_collapses_on_ack() {
        let g = guest(TimerMode::OneMissedTickPending);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.clock.advance(Duration::from_micros(200));
        pt_save_timer(&g.vcpu);
        g.clock.set_ns(5_700_000);
        pt_restore_timer(&g.vcpu);
        assert_eq!(pending(&pt), 5);

        pt_update_irq(&g.vcpu);
        assert!(pt_lock(&pt, |_, _, s| s.irq_issued).unwrap());
        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x08,
                source: IntSource::Pic,
            },
        );

        assert_eq!(pending(&pt), 0);
        let gtime = g.vcpu.guest_time();
        assert_eq!(
            pt_lock(&pt, |_, _, s| s.last_plt_gtime).unwrap(),
            gtime
        );
    }

    #[test]
    fn test_delay_mode_freezes_guest_time() {
        let g = guest(TimerMode::DelayForMissedTicks);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.clock.advance(Duration::from_micros(200));
        let frozen = g.vcpu.guest_time();
        pt_save_timer(&g.vcpu);

        g.clock.set_ns(5_700_000);
        pt_restore_timer(&g.vcpu);

        // No ticks accumulate and the off-core interval is invisible
        assert_eq!(pending(&pt), 0);
        assert_eq!(scheduled(&pt), 6_000_000);
        assert_eq!(g.vcpu.guest_time(), frozen);
    }

    #[test]
    fn test_delay_mode_guest_time_monotone() {
        let g = guest(TimerMode::DelayForMissedTicks);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        let mut last = g.vcpu.guest_time();
        let mut check = |v: &Vcpu| {
            let now = v.guest_time();
            assert!(now >= last);
            last = now;
        };

        g.clock.advance(Duration::from_micros(400));
        pt_save_timer(&g.vcpu);
        check(&g.vcpu);

        g.clock.set_ns(7_300_000);
        pt_restore_timer(&g.vcpu);
        check(&g.vcpu);

        g.clock.set_ns(8_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        check(&g.vcpu);

        pt_update_irq(&g.vcpu);
        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x08,
                source: IntSource::Pic,
            },
        );
        check(&g.vcpu);
    }

    #[test]
    fn test_one_shot_unlinks_on_ack() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Lapic);
        enable_lapic(&g.vcpu);
        create_periodic_time(
            &g.vcpu,
            &pt,
            Duration::from_millis(2),
            0xec,
            true,
            None,
        );

        // LAPIC-source expiries are phase-offset by half a period
        assert_eq!(scheduled(&pt), 3_000_000);

        g.clock.set_ns(3_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 1);

        pt_update_irq(&g.vcpu);
        assert!(g.vcpu.lapic.irr_test(0xec));

        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0xec,
                source: IntSource::Lapic,
            },
        );
        assert!(!pt_lock(&pt, |_, _, s| s.on_list).unwrap());
        assert_eq!(g.vcpu.tm.lock().list.len(), 0);

        // Nothing is armed anymore
        g.clock.set_ns(100_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 1);
    }

    #[test]
    fn test_competing_timers_most_behind_wins() {
        let g = guest(TimerMode::NoDelay);
        enable_lapic(&g.vcpu);
        let fast = PeriodicTime::new(PtSource::Lapic);
        let slow = PeriodicTime::new(PtSource::Lapic);
        create_periodic_time(&g.vcpu, &fast, MS, 0x30, false, None);
        create_periodic_time(
            &g.vcpu,
            &slow,
            Duration::from_millis(3),
            0x38,
            false,
            None,
        );

        pt_save_timer(&g.vcpu);
        g.clock.set_ns(5_000_000);
        pt_restore_timer(&g.vcpu);
        assert!(pending(&fast) > 0);
        assert!(pending(&slow) > 0);

        // The 1ms timer has the smaller guest-time key and must be asserted
        // first
        pt_update_irq(&g.vcpu);
        assert!(g.vcpu.lapic.irr_test(0x30));
        assert!(!g.vcpu.lapic.irr_test(0x38));

        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x30,
                source: IntSource::Lapic,
            },
        );
        g.vcpu.lapic.clear_irq(0x30);

        // Still three periods behind; the fast timer keeps winning
        pt_update_irq(&g.vcpu);
        assert!(g.vcpu.lapic.irr_test(0x30));
        assert!(!g.vcpu.lapic.irr_test(0x38));
    }

    #[test]
    fn test_update_irq_skips_masked_sources() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Lapic);
        create_periodic_time(&g.vcpu, &pt, MS, 0x40, false, None);

        g.clock.set_ns(2_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert!(pending(&pt) > 0);

        // The virtual local APIC is still disabled, so nothing is injected
        pt_update_irq(&g.vcpu);
        assert!(!g.vcpu.lapic.irr_test(0x40));
        assert!(!pt_lock(&pt, |_, _, s| s.irq_issued).unwrap());

        enable_lapic(&g.vcpu);
        pt_update_irq(&g.vcpu);
        assert!(g.vcpu.lapic.irr_test(0x40));
        assert!(pt_lock(&pt, |_, _, s| s.irq_issued).unwrap());
        assert!(pending(&pt) >= 1);
    }

    #[test]
    fn test_isa_route_through_ioapic_when_pic_masked() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        // Mask IRQ0 on the PIC, route GSI2 through the I/O APIC instead
        outb(&g.vm, 0x21, 0x01);
        g.vm.ioapic()
            .write_entry(
                2,
                IoRedTblEntry::new(
                    0x30,
                    DeliveryMode::Fixed,
                    TriggerMode::Edge,
                    false,
                    0,
                )
                .unwrap(),
            )
            .unwrap();

        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));

        pt_update_irq(&g.vcpu);
        assert_eq!(g.vm.ioapic().delivered(2), 1);

        // The ack arrives with the vector the redirection entry programmed
        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x30,
                source: IntSource::Lapic,
            },
        );
        assert_eq!(pending(&pt), 0);
    }

    #[test]
    fn test_isa_fully_masked_is_not_injected() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        outb(&g.vm, 0x21, 0x01); // mask IRQ0; GSI2 entry stays masked too

        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));

        pt_update_irq(&g.vcpu);
        assert!(!pt_lock(&pt, |_, _, s| s.irq_issued).unwrap());
        assert_eq!(g.vm.ioapic().delivered(2), 0);
    }

    #[test]
    fn test_intr_post_ignores_foreign_vector() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        pt_update_irq(&g.vcpu);

        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x99,
                source: IntSource::Pic,
            },
        );
        assert_eq!(pending(&pt), 1);
        assert!(pt_lock(&pt, |_, _, s| s.irq_issued).unwrap());
    }

    #[test]
    fn test_issued_implies_pending() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        for step in 1..=8u64 {
            g.clock.set_ns(step * 500_000);
            g.host.expire_elapsed(CoreId::from(0));
            pt_update_irq(&g.vcpu);
            let (issued, nr) =
                pt_lock(&pt, |_, _, s| (s.irq_issued, s.pending_intr_nr))
                    .unwrap();
            assert!(!issued || nr >= 1);
            if step % 2 == 0 {
                pt_intr_post(
                    &g.vcpu,
                    IntAck {
                        vector: 0x08,
                        source: IntSource::Pic,
                    },
                );
            }
        }
    }

    #[test]
    fn test_period_clamped_with_warning() {
        testing_logger::setup();
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(
            &g.vcpu,
            &pt,
            Duration::from_micros(500),
            0,
            false,
            None,
        );
        assert_eq!(
            pt_lock(&pt, |_, _, s| s.period).unwrap(),
            MIN_PERIOD
        );
        testing_logger::validate(|logs| {
            assert!(logs
                .iter()
                .any(|entry| entry.body.contains("platform timer period")));
        });
    }

    #[test]
    fn test_one_shot_period_not_clamped() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(
            &g.vcpu,
            &pt,
            Duration::from_micros(100),
            0,
            true,
            None,
        );
        assert_eq!(
            pt_lock(&pt, |_, _, s| s.period).unwrap(),
            Duration::from_micros(100)
        );
    }

    #[test]
    fn test_destroy_never_created_is_noop() {
        let pt = PeriodicTime::new(PtSource::Isa);
        destroy_periodic_time(&pt);
        destroy_periodic_time(&pt);
    }

    #[test]
    fn test_recreate_replaces_programming() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        create_periodic_time(
            &g.vcpu,
            &pt,
            Duration::from_millis(4),
            1,
            false,
            None,
        );

        assert_eq!(g.vcpu.tm.lock().list.len(), 1);
        assert_eq!(pt_lock(&pt, |_, _, s| s.irq).unwrap(), 1);
        assert_eq!(scheduled(&pt), 4_000_000);
    }

    #[test]
    fn test_reset_restarts_from_now() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.clock.set_ns(3_500_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert!(pending(&pt) > 0);

        pt_reset(&g.vcpu);
        assert_eq!(pending(&pt), 0);
        assert_eq!(scheduled(&pt), 4_500_000);
        assert_eq!(
            pt_lock(&pt, |v, _, s| (s.last_plt_gtime, v.guest_time()))
                .map(|(a, b)| a == b),
            Some(true)
        );
    }

    #[test]
    fn test_migrate_moves_host_timer() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.vcpu.set_processor(CoreId::from(1));
        pt_migrate(&g.vcpu);

        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 0);
        g.host.expire_elapsed(CoreId::from(1));
        assert_eq!(pending(&pt), 1);
    }

    #[test]
    fn test_blocked_vcpu_keeps_timers_running() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        g.vcpu.block();
        pt_save_timer(&g.vcpu);

        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), 1);
        // The expiry kicked the blocked vcpu awake
        assert!(!g.vcpu.is_blocked());
        assert!(g.vcpu.take_kick());
    }

    #[test]
    fn test_ack_callback_runs_outside_lock() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        program_pic(&g.vm);
        let calls = Arc::new(AtomicUsize::new(0));
        let observer = calls.clone();
        let cb: TimeCallback = Arc::new(move |v: &Vcpu| {
            // Re-entering the timer lock here deadlocks if the callback were
            // invoked under it
            let _ = v.tm.lock();
            observer.fetch_add(1, Ordering::SeqCst);
        });
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, Some(cb));

        g.clock.set_ns(1_000_000);
        g.host.expire_elapsed(CoreId::from(0));
        pt_update_irq(&g.vcpu);
        pt_intr_post(
            &g.vcpu,
            IntAck {
                vector: 0x08,
                source: IntSource::Pic,
            },
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_fire_and_destroy() {
        let g = guest(TimerMode::NoDelay);
        let pt = PeriodicTime::new(PtSource::Isa);
        create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);

        let host = g.host.clone();
        let clock = g.clock.clone();
        let expirer = thread::spawn(move || {
            for _ in 0..1000 {
                clock.advance(MS);
                host.expire_elapsed(CoreId::from(0));
            }
        });

        for _ in 0..100 {
            destroy_periodic_time(&pt);
            create_periodic_time(&g.vcpu, &pt, MS, 0, false, None);
        }
        destroy_periodic_time(&pt);
        expirer.join().unwrap();

        // Destroyed: no callback may fire anymore
        let settled = pending(&pt);
        g.clock.advance(Duration::from_millis(50));
        g.host.expire_elapsed(CoreId::from(0));
        assert_eq!(pending(&pt), settled);
        assert_eq!(g.vcpu.tm.lock().list.len(), 0);
    }
}
