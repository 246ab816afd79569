//! Virtual I/O APIC
//!
//! Models the redirection table the guest programs to route global system
//! interrupts, and the edge bookkeeping the ISA assertion path feeds. Fan
//! out to the local APICs is left to the injection path.

use crate::error::{Error, Result};

use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Redirection table entries per I/O APIC
pub const NUM_PINS: usize = 24;

const IOREDTBL_MASK_BIT: u64 = 1 << 16;
const IOREDTBL_KNOWN_BITS_MASK: u64 = 0xff00_0000_0001_87ff;

/// The action the destination APICs take on a signal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryMode {
    /// Deliver on the INTR signal of the destination cores
    Fixed = 0b000,
    /// Deliver to the lowest-priority destination core
    LowestPriority = 0b001,
    /// Deliver as an externally supplied vector. Must be edge triggered.
    ExtINT = 0b111,
}

impl TryFrom<u8> for DeliveryMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<DeliveryMode> {
        match value {
            0b000 => Ok(DeliveryMode::Fixed),
            0b001 => Ok(DeliveryMode::LowestPriority),
            0b111 => Ok(DeliveryMode::ExtINT),
            _ => Err(Error::InvalidValue(format!(
                "Invalid delivery mode: 0x{:x}",
                value
            ))),
        }
    }
}

/// Type of signal on the interrupt pin that triggers an interrupt.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerMode {
    /// Edge sensitive trigger.
    Edge = 0x00,
    /// Level sensitive trigger.
    Level = 0x01,
}

impl TryFrom<u8> for TriggerMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<TriggerMode> {
        match value {
            0x00 => Ok(TriggerMode::Edge),
            0x01 => Ok(TriggerMode::Level),
            _ => Err(Error::InvalidValue(format!(
                "Invalid trigger mode: 0x{:x}",
                value
            ))),
        }
    }
}

/// An entry in the I/O redirection table.
#[derive(Debug, Clone, PartialEq)]
pub struct IoRedTblEntry {
    vector: u8,
    delivery_mode: DeliveryMode,
    trigger_mode: TriggerMode,
    interrupt_mask: bool,
    destination: u8,
}

impl IoRedTblEntry {
    /// Create an I/O redirection table entry.
    pub fn new(
        vector: u8,
        delivery_mode: DeliveryMode,
        trigger_mode: TriggerMode,
        interrupt_mask: bool,
        destination: u8,
    ) -> Result<IoRedTblEntry> {
        let entry = IoRedTblEntry {
            vector,
            delivery_mode,
            trigger_mode,
            interrupt_mask,
            destination,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// The vector this entry delivers.
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Whether this entry is masked.
    pub fn masked(&self) -> bool {
        self.interrupt_mask
    }

    fn validate(&self) -> Result<()> {
        if self.trigger_mode == TriggerMode::Level
            && self.delivery_mode == DeliveryMode::ExtINT
        {
            return Err(Error::InvalidValue(format!(
                "The delivery mode `0b{:b}` is invalid for level trigger mode",
                self.delivery_mode as u8
            )));
        }
        Ok(())
    }
}

impl TryFrom<u64> for IoRedTblEntry {
    type Error = Error;

    fn try_from(bits: u64) -> Result<IoRedTblEntry> {
        if (bits & !IOREDTBL_KNOWN_BITS_MASK) != 0 {
            return Err(Error::NotSupported);
        }

        let entry = IoRedTblEntry {
            vector: (bits & 0xff) as u8,
            delivery_mode: DeliveryMode::try_from(((bits >> 8) & 0x7) as u8)?,
            trigger_mode: TriggerMode::try_from(((bits >> 15) & 0x1) as u8)?,
            interrupt_mask: bits & IOREDTBL_MASK_BIT != 0,
            destination: ((bits >> 56) & 0xff) as u8,
        };
        entry.validate()?;
        Ok(entry)
    }
}

impl From<IoRedTblEntry> for u64 {
    fn from(entry: IoRedTblEntry) -> u64 {
        let mut bits = entry.vector as u64;
        bits |= (entry.delivery_mode as u64) << 8;
        bits |= (entry.trigger_mode as u64) << 15;
        if entry.interrupt_mask {
            bits |= IOREDTBL_MASK_BIT;
        }
        bits |= (entry.destination as u64) << 56;
        bits
    }
}

/// The guest's virtual I/O APIC.
///
/// Every pin resets masked. The redirection table is stored raw and
/// atomically so the injection path can consult mask and vector fields
/// without further locking.
pub struct VirtIoApic {
    redirtbl: [AtomicU64; NUM_PINS],
    delivered: [AtomicU32; NUM_PINS],
}

impl VirtIoApic {
    pub fn new() -> Self {
        const MASKED: AtomicU64 = AtomicU64::new(IOREDTBL_MASK_BIT);
        const ZERO: AtomicU32 = AtomicU32::new(0);
        VirtIoApic {
            redirtbl: [MASKED; NUM_PINS],
            delivered: [ZERO; NUM_PINS],
        }
    }

    /// Read back the redirection entry for `gsi`.
    pub fn entry(&self, gsi: u32) -> Result<IoRedTblEntry> {
        let raw = self
            .redirtbl
            .get(gsi as usize)
            .ok_or(Error::NotFound)?
            .load(Ordering::SeqCst);
        IoRedTblEntry::try_from(raw)
    }

    /// Program the redirection entry for `gsi`.
    pub fn write_entry(&self, gsi: u32, entry: IoRedTblEntry) -> Result<()> {
        debug!("Mapping gsi=0x{:x} to {:?}", gsi, entry);
        self.redirtbl
            .get(gsi as usize)
            .ok_or(Error::NotFound)?
            .store(entry.into(), Ordering::SeqCst);
        Ok(())
    }

    /// Whether the entry for `gsi` is masked. Unconnected pins count as
    /// masked.
    pub fn entry_masked(&self, gsi: u32) -> bool {
        match self.redirtbl.get(gsi as usize) {
            Some(raw) => raw.load(Ordering::SeqCst) & IOREDTBL_MASK_BIT != 0,
            None => true,
        }
    }

    /// The vector the entry for `gsi` delivers.
    pub fn entry_vector(&self, gsi: u32) -> u8 {
        match self.redirtbl.get(gsi as usize) {
            Some(raw) => (raw.load(Ordering::SeqCst) & 0xff) as u8,
            None => 0,
        }
    }

    /// Signal a rising edge on `gsi`.
    pub fn irq_edge(&self, gsi: u32) {
        if !self.entry_masked(gsi) {
            self.delivered[gsi as usize].fetch_add(1, Ordering::SeqCst);
        }
    }

    /// The number of edges delivered through `gsi` so far.
    pub fn delivered(&self, gsi: u32) -> u32 {
        match self.delivered.get(gsi as usize) {
            Some(count) => count.load(Ordering::SeqCst),
            None => 0,
        }
    }
}

impl Default for VirtIoApic {
    fn default() -> Self {
        VirtIoApic::new()
    }
}

impl fmt::Debug for VirtIoApic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtIoApic({} pins)", NUM_PINS)
    }
}
