#![deny(missing_docs)]

use crate::config::UserVmConfig;
use crate::error::{Error, Result};
use crate::time::{Clock, HostTimers};
use crate::virtdev::ioapic::VirtIoApic;
use crate::virtdev::pic::Pic8259;
use crate::virtdev::{DeviceEvent, DeviceMap, EmulatedDevice, Port};
use crate::vpt::TimerMode;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU16, Ordering};
use spin::RwLock;

/// Map an ISA IRQ to the global system interrupt it enters the I/O APIC on.
///
/// The timer output is wired to pin 2; everything else is identity mapped.
pub fn isa_irq_to_gsi(isa_irq: u8) -> u32 {
    if isa_irq == 0 {
        2
    } else {
        isa_irq as u32
    }
}

/// A virtual machine
///
/// Owns the guest-wide emulated interrupt controllers (the 8259 pair and
/// the I/O APIC are shared across the guest's vcpus), the map of emulated
/// devices, and the domain-level timer policy.
pub struct VirtualMachine {
    /// The numeric ID of this virtual machine
    pub id: u32,

    /// The configuration of this virtual machine
    pub config: UserVmConfig,

    pic: Arc<RwLock<Pic8259>>,
    ioapic: VirtIoApic,
    isa_lines: AtomicU16,
    devices: RwLock<DeviceMap>,
    host: Arc<HostTimers>,
}

impl VirtualMachine {
    /// Construct a new `VirtualMachine` serviced by the given host timers.
    pub fn new(
        id: u32,
        config: UserVmConfig,
        host: Arc<HostTimers>,
    ) -> Result<Arc<Self>> {
        let pic = Pic8259::new();
        let mut devices = DeviceMap::default();
        devices.register_device(pic.clone())?;

        Ok(Arc::new(VirtualMachine {
            id,
            config,
            pic,
            ioapic: VirtIoApic::new(),
            isa_lines: AtomicU16::new(0),
            devices: RwLock::new(devices),
            host,
        }))
    }

    /// The host timer facility servicing this machine.
    pub fn host(&self) -> &Arc<HostTimers> {
        &self.host
    }

    /// The host clock.
    pub fn clock(&self) -> &Clock {
        self.host.clock()
    }

    /// The tick-accounting policy for this machine's guest timers.
    pub fn timer_mode(&self) -> TimerMode {
        self.config.timer_mode
    }

    /// The guest's virtual 8259 pair.
    pub fn pic(&self) -> &Arc<RwLock<Pic8259>> {
        &self.pic
    }

    /// The guest's virtual I/O APIC.
    pub fn ioapic(&self) -> &VirtIoApic {
        &self.ioapic
    }

    /// Register an emulated device for port-IO dispatch.
    pub fn register_device(
        &self,
        dev: Arc<RwLock<dyn EmulatedDevice>>,
    ) -> Result<()> {
        self.devices.write().register_device(dev)
    }

    /// Dispatch a guest port-IO access to the device servicing `port`.
    pub fn dispatch_event(&self, port: Port, event: DeviceEvent) -> Result<()> {
        let devices = self.devices.read();
        let dev = devices.find_device(port).ok_or_else(|| {
            Error::MissingDevice(format!("No device for port 0x{:x}", port))
        })?;
        let result = dev.write().on_event(event);
        result
    }

    /// Raise an ISA IRQ line. The 8259 latches the level; the I/O APIC sees
    /// an edge only on a low-to-high transition.
    pub fn isa_irq_assert(&self, irq: u8) {
        let bit = 1u16 << irq;
        let prev = self.isa_lines.fetch_or(bit, Ordering::SeqCst);
        self.pic.read().assert_irq(irq);
        if prev & bit == 0 {
            self.ioapic.irq_edge(isa_irq_to_gsi(irq));
        }
    }

    /// Lower an ISA IRQ line.
    pub fn isa_irq_deassert(&self, irq: u8) {
        let bit = 1u16 << irq;
        self.isa_lines.fetch_and(!bit, Ordering::SeqCst);
        self.pic.read().deassert_irq(irq);
    }
}
