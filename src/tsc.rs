use crate::error::{Error, Result};
use crate::time::{Instant, TimeSource};

use raw_cpuid::CpuId;
use x86::io::{inb, outb};

const PIT_HZ: u64 = 1_193_182;
const CALIBRATE_COUNT: u16 = 0x800; // Approx 1.7ms

const PIT_COUNTER_2: u16 = 0x42;
const PIT_MODE_CONTROL: u16 = 0x43;
const PIT_PS2_CTRL_B: u16 = 0x61;

const PPCB_T2GATE: u8 = 1 << 0;
const PPCB_SPKR: u8 = 1 << 1;
const PPCB_T2OUT: u8 = 1 << 5;

/// A `TimeSource` backed by the invariant TSC.
pub struct Tsc {
    khz: u64,
}

impl TimeSource for Tsc {
    fn now(&self) -> Instant {
        let ticks = read_tsc();
        Instant((ticks as u128 * 1_000_000 / self.khz as u128) as u64)
    }

    fn cpu_khz(&self) -> u64 {
        self.khz
    }
}

pub fn read_tsc() -> u64 {
    unsafe { x86::time::rdtsc() }
}

/// Calibrate the TSC frequency against PIT channel 2 and return a
/// `TimeSource` driven by it.
///
/// This must run before any guest owns the PIT, with interrupts disabled.
pub unsafe fn calibrate_tsc() -> Result<Tsc> {
    let features = CpuId::new()
        .get_feature_info()
        .ok_or(Error::NotSupported)?;
    if !features.has_tsc() {
        return Err(Error::NotSupported);
    }

    let orig: u8 = inb(PIT_PS2_CTRL_B);
    outb(PIT_PS2_CTRL_B, (orig & !PPCB_SPKR) | PPCB_T2GATE);

    // Channel 2, lo/hi byte access, mode 0, binary
    outb(PIT_MODE_CONTROL, 0b10110000);

    outb(PIT_COUNTER_2, (CALIBRATE_COUNT & 0xff) as u8);
    outb(PIT_COUNTER_2, (CALIBRATE_COUNT >> 8) as u8);

    let start = read_tsc();
    while (inb(PIT_PS2_CTRL_B) & PPCB_T2OUT) == 0 {}
    let end = read_tsc();

    outb(PIT_PS2_CTRL_B, orig);

    let diff = end - start;
    let khz = (diff * PIT_HZ) / (CALIBRATE_COUNT as u64 * 1000);
    info!("tsc calibrate diff={} (khz={})", diff, khz);

    Ok(Tsc { khz })
}
