//! # Guest CPUs
//!
//! A `Vcpu` is one virtual CPU of a guest. The scheduler binds it to a
//! physical core, may move it between cores, and parks it off-core when it
//! blocks. The platform-timer state hanging off each vcpu (its timer list
//! and lock, and the guest-time offset) lives here; the timer operations
//! themselves are in `vpt`.

use crate::percore::CoreId;
use crate::virtdev::lapic::VirtLapic;
use crate::vm::VirtualMachine;
use crate::vpt::PeriodicTime;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use spin::Mutex;

/// Per-vcpu platform timer state, all guarded by the vcpu's timer lock.
pub(crate) struct VcpuTimers {
    /// The timers bound to this vcpu, in no particular order
    pub(crate) list: Vec<Arc<PeriodicTime>>,

    /// Guest time snapshotted at the last freeze, 0 when not frozen
    pub(crate) guest_time: u64,
}

impl VcpuTimers {
    pub(crate) fn unlink(&mut self, pt: &PeriodicTime) {
        self.list
            .retain(|entry| !core::ptr::eq(Arc::as_ptr(entry), pt));
    }
}

/// A virtual CPU.
///
/// Shared between the core that runs it, the timer expiry callbacks (which
/// may run on any core) and the device models that program timers against
/// it, so everything mutable is behind a lock or atomic.
pub struct Vcpu {
    /// Identifier of this vcpu within its virtual machine
    pub id: u32,

    /// The virtual machine this vcpu belongs to
    pub vm: Arc<VirtualMachine>,

    /// This vcpu's virtual local APIC
    pub lapic: VirtLapic,

    processor: AtomicU32,
    blocked: AtomicBool,
    kicked: AtomicBool,
    gtime_offset: AtomicI64,
    pub(crate) tm: Mutex<VcpuTimers>,
}

impl Vcpu {
    /// Create a new `Vcpu` associated with the given `VirtualMachine`,
    /// initially bound to the physical core `processor`.
    pub fn new(
        vm: &Arc<VirtualMachine>,
        id: u32,
        processor: CoreId,
    ) -> Arc<Self> {
        debug!("Creating vcpu {} on core {}", id, processor);
        Arc::new(Vcpu {
            id,
            vm: vm.clone(),
            lapic: VirtLapic::new(),
            processor: AtomicU32::new(processor.raw),
            blocked: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            gtime_offset: AtomicI64::new(0),
            tm: Mutex::new(VcpuTimers {
                list: Vec::new(),
                guest_time: 0,
            }),
        })
    }

    /// The physical core currently servicing this vcpu's host timers.
    pub fn processor(&self) -> CoreId {
        CoreId::from(self.processor.load(Ordering::SeqCst))
    }

    /// Rebind this vcpu to a new physical core.
    ///
    /// The caller is the scheduler; it must follow up with `vpt::pt_migrate`
    /// so the host timers move along.
    pub fn set_processor(&self, processor: CoreId) {
        self.processor.store(processor.raw, Ordering::SeqCst);
    }

    /// Mark this vcpu as blocked (waiting for an event, off-core).
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    /// Returns whether this vcpu is blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Wake this vcpu if it is blocked and force it out of guest context so
    /// the injection path runs. Never blocks the caller.
    pub fn kick(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        self.kicked.store(true, Ordering::SeqCst);
    }

    /// Consume a pending kick. Used by the run loop (and tests) to learn
    /// that an interrupt source wants the injection path executed.
    pub fn take_kick(&self) -> bool {
        self.kicked.swap(false, Ordering::SeqCst)
    }

    /// Guest-visible time of this vcpu, in CPU cycles.
    pub fn guest_time(&self) -> u64 {
        let clock = self.vm.clock();
        let cycles = clock.cycles_at(clock.now()) as i64;
        (cycles + self.gtime_offset.load(Ordering::SeqCst)) as u64
    }

    /// Warp guest-visible time so the guest observes `gtime` now.
    pub fn set_guest_time(&self, gtime: u64) {
        let clock = self.vm.clock();
        let cycles = clock.cycles_at(clock.now()) as i64;
        self.gtime_offset
            .store(gtime as i64 - cycles, Ordering::SeqCst);
    }
}
