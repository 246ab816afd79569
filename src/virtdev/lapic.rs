use crate::error::{Error, Result};
use crate::vcpu::Vcpu;
use crate::vpt::{self, PeriodicTime, PtSource};

use alloc::sync::Arc;
use bitflags::bitflags;
use core::convert::TryFrom;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::time::Duration;
use num_enum::TryFromPrimitive;

/// IA32_APIC_BASE flag enabling the local APIC in xAPIC mode
pub const APIC_BASE_ENABLE: u64 = 1 << 11;

// One tick of the APIC timer in bus clock terms
const APIC_BUS_CYCLE_NS: u64 = 10;

const SVR_APIC_ENABLED: u32 = 1 << 8;

bitflags! {
    /// Flags common to the local vector table registers
    pub struct LvtFlags: u32 {
        const MASKED = 1 << 16;
        const TIMER_PERIODIC = 1 << 17;
    }
}

const LVT_DELIVERY_MODE: u32 = 0b111 << 8;
const LVT_DELIVERY_EXTINT: u32 = 0b111 << 8;

#[derive(Debug)]
enum ApicRegisterOffset {
    Simple(ApicRegisterSimpleOffset),
    InterruptRequest(u16),
}

#[derive(Debug, TryFromPrimitive)]
#[repr(u16)]
enum ApicRegisterSimpleOffset {
    ApicId = 0x20,
    ApicVersion = 0x30,
    EndOfInterrupt = 0xb0,
    SpuriousInterruptVector = 0xf0,
    LvtTimer = 0x320,
    LvtLINT0 = 0x350,
    TimerInitialCount = 0x380,
    TimerCurrentCount = 0x390,
    TimerDivideConfig = 0x3e0,
}

impl TryFrom<u16> for ApicRegisterOffset {
    type Error = Error;

    fn try_from(value: u16) -> Result<ApicRegisterOffset> {
        if value & 0b1111 != 0 {
            return Err(Error::InvalidValue(format!(
                "APIC register offset not aligned: 0x{:x}",
                value
            )));
        }

        if let Ok(simple_reg) = ApicRegisterSimpleOffset::try_from(value) {
            return Ok(ApicRegisterOffset::Simple(simple_reg));
        }

        match value {
            0x200..=0x270 => {
                Ok(ApicRegisterOffset::InterruptRequest((value - 0x200) >> 4))
            }
            offset => Err(Error::InvalidValue(format!(
                "Invalid APIC register offset: 0x{:x}",
                offset
            ))),
        }
    }
}

/// The virtual local APIC of one guest CPU
///
/// Only the state the platform-timer paths depend on is modeled: the
/// enable bits, the timer and LINT0 vector table entries, the timer
/// counters and the interrupt request bits. Everything is atomic so the
/// injection path can consult it while holding the vcpu timer lock.
pub struct VirtLapic {
    apic_base: AtomicU64,
    svr: AtomicU32,
    lvt_timer: AtomicU32,
    lvt_lint0: AtomicU32,
    divide_conf: AtomicU32,
    initial_count: AtomicU32,
    irr: [AtomicU32; 8],
    pt: Arc<PeriodicTime>,
}

impl VirtLapic {
    pub fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        VirtLapic {
            // Powered up hardware-disabled; LVTs reset masked
            apic_base: AtomicU64::new(0xfee0_0000),
            svr: AtomicU32::new(0xff),
            lvt_timer: AtomicU32::new(LvtFlags::MASKED.bits()),
            lvt_lint0: AtomicU32::new(LvtFlags::MASKED.bits()),
            divide_conf: AtomicU32::new(0),
            initial_count: AtomicU32::new(0),
            irr: [ZERO; 8],
            pt: PeriodicTime::new(PtSource::Lapic),
        }
    }

    /// Update the guest-visible IA32_APIC_BASE MSR value.
    pub fn set_apic_base(&self, value: u64) {
        self.apic_base.store(value, Ordering::SeqCst);
    }

    fn hw_enabled(&self) -> bool {
        self.apic_base.load(Ordering::SeqCst) & APIC_BASE_ENABLE != 0
    }

    /// Whether the local APIC is delivering interrupts at all (enabled in
    /// the base MSR and software-enabled through the spurious register).
    pub fn enabled(&self) -> bool {
        self.hw_enabled()
            && self.svr.load(Ordering::SeqCst) & SVR_APIC_ENABLED != 0
    }

    /// Whether the timer vector table entry is masked.
    pub fn timer_masked(&self) -> bool {
        self.lvt_timer.load(Ordering::SeqCst) & LvtFlags::MASKED.bits() != 0
    }

    /// Whether legacy PIC interrupts can reach this CPU: either the local
    /// APIC is out of the way entirely, or LINT0 passes them as ExtINT.
    pub fn accept_pic_intr(&self) -> bool {
        if !self.hw_enabled() {
            return true;
        }
        let lint0 = self.lvt_lint0.load(Ordering::SeqCst);
        lint0 & LvtFlags::MASKED.bits() == 0
            && lint0 & LVT_DELIVERY_MODE == LVT_DELIVERY_EXTINT
    }

    /// Latch `vector` into the interrupt request register (edge triggered).
    pub fn set_irq(&self, vector: u8) {
        self.irr[vector as usize / 32]
            .fetch_or(1 << (vector % 32), Ordering::SeqCst);
    }

    /// Whether `vector` is latched in the interrupt request register.
    pub fn irr_test(&self, vector: u8) -> bool {
        self.irr[vector as usize / 32].load(Ordering::SeqCst)
            & (1 << (vector % 32))
            != 0
    }

    /// Drop `vector` from the interrupt request register.
    pub fn clear_irq(&self, vector: u8) {
        self.irr[vector as usize / 32]
            .fetch_and(!(1 << (vector % 32)), Ordering::SeqCst);
    }

    /// The platform timer backing this local APIC's timer.
    pub fn timer(&self) -> &Arc<PeriodicTime> {
        &self.pt
    }

    fn timer_period(&self, count: u32) -> Duration {
        let shift = timer_divide_shift(self.divide_conf.load(Ordering::SeqCst));
        Duration::from_nanos((APIC_BUS_CYCLE_NS * count as u64) << shift)
    }

    pub fn register_read(&self, offset: u16) -> Result<u32> {
        let offset = ApicRegisterOffset::try_from(offset)?;
        let value = match offset {
            ApicRegisterOffset::Simple(ref simple) => match simple {
                ApicRegisterSimpleOffset::ApicId => 0,
                ApicRegisterSimpleOffset::ApicVersion => 0x0001_0014,
                ApicRegisterSimpleOffset::SpuriousInterruptVector => {
                    self.svr.load(Ordering::SeqCst)
                }
                ApicRegisterSimpleOffset::LvtTimer => {
                    self.lvt_timer.load(Ordering::SeqCst)
                }
                ApicRegisterSimpleOffset::LvtLINT0 => {
                    self.lvt_lint0.load(Ordering::SeqCst)
                }
                ApicRegisterSimpleOffset::TimerInitialCount => {
                    self.initial_count.load(Ordering::SeqCst)
                }
                ApicRegisterSimpleOffset::TimerDivideConfig => {
                    self.divide_conf.load(Ordering::SeqCst)
                }
                _ => 0,
            },
            ApicRegisterOffset::InterruptRequest(word) => {
                self.irr[word as usize].load(Ordering::SeqCst)
            }
        };
        Ok(value)
    }

    pub fn register_write(
        &self,
        vcpu: &Arc<Vcpu>,
        offset: u16,
        value: u32,
    ) -> Result<()> {
        let offset = ApicRegisterOffset::try_from(offset)?;
        match offset {
            ApicRegisterOffset::Simple(ref simple) => match simple {
                ApicRegisterSimpleOffset::EndOfInterrupt => (),
                ApicRegisterSimpleOffset::SpuriousInterruptVector => {
                    self.svr.store(value, Ordering::SeqCst);
                }
                ApicRegisterSimpleOffset::LvtTimer => {
                    self.lvt_timer.store(value, Ordering::SeqCst);
                }
                ApicRegisterSimpleOffset::LvtLINT0 => {
                    self.lvt_lint0.store(value, Ordering::SeqCst);
                }
                ApicRegisterSimpleOffset::TimerDivideConfig => {
                    self.divide_conf.store(value, Ordering::SeqCst);
                }
                ApicRegisterSimpleOffset::TimerInitialCount => {
                    self.initial_count.store(value, Ordering::SeqCst);
                    if value == 0 {
                        vpt::destroy_periodic_time(&self.pt);
                    } else {
                        let lvtt = self.lvt_timer.load(Ordering::SeqCst);
                        let one_shot =
                            lvtt & LvtFlags::TIMER_PERIODIC.bits() == 0;
                        vpt::create_periodic_time(
                            vcpu,
                            &self.pt,
                            self.timer_period(value),
                            (lvtt & 0xff) as u8,
                            one_shot,
                            None,
                        );
                    }
                }
                _ => info!(
                    "Write to virtual local apic: {:?}, value=0x{:x}",
                    simple, value
                ),
            },
            ApicRegisterOffset::InterruptRequest(_) => {
                return Err(Error::InvalidValue(
                    "IRR registers are read-only".into(),
                ))
            }
        }
        Ok(())
    }
}

impl Default for VirtLapic {
    fn default() -> Self {
        VirtLapic::new()
    }
}

// See SDM 10.5.4: bits 0, 1 and 3 of the divide configuration register
// select a divisor of 2^(n+1), with 0b111 meaning divide by 1.
fn timer_divide_shift(dcr: u32) -> u64 {
    let packed = (dcr & 0b11) | ((dcr & 0b1000) >> 1);
    ((packed + 1) & 7) as u64
}
