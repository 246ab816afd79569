use crate::error::Result;
use crate::virtdev::{
    DeviceEvent, DeviceRegion, EmulatedDevice, Port, PortReadRequest,
    PortWriteRequest,
};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::TryInto;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::RwLock;

#[derive(Default, Debug)]
pub struct PicState {
    imr: AtomicU8,
    irr: AtomicU8,
    irq_base: AtomicU8,
    // Nonzero while an ICW1 left the chip waiting for the ICW2 vector base
    init_state: AtomicU8,
}

/// The guest's pair of virtual 8259 interrupt controllers
///
/// Enough of the 8259 is modeled for platform-timer delivery: the interrupt
/// mask and request registers and the vector base programmed by ICW2. The
/// inputs are level sensitive; `assert_irq` latches a request until the line
/// drops.
#[derive(Default, Debug)]
pub struct Pic8259 {
    master: PicState,
    slave: PicState,
}

impl Pic8259 {
    const PIC_MASTER_COMMAND: Port = 0x0020;
    const PIC_MASTER_DATA: Port = Self::PIC_MASTER_COMMAND + 1;
    const PIC_SLAVE_COMMAND: Port = 0x00a0;
    const PIC_SLAVE_DATA: Port = Self::PIC_SLAVE_COMMAND + 1;

    const ICW1_INIT: u8 = 1 << 4;

    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Pic8259::default()))
    }

    fn chip(&self, irq: u8) -> &PicState {
        if irq < 8 {
            &self.master
        } else {
            &self.slave
        }
    }

    /// Whether `irq` is masked in its chip's IMR.
    pub fn is_masked(&self, irq: u8) -> bool {
        self.chip(irq).imr.load(Ordering::SeqCst) & (1 << (irq & 7)) != 0
    }

    /// The vector `irq` is delivered as, per the programmed vector base.
    pub fn vector_for(&self, irq: u8) -> u8 {
        self.chip(irq)
            .irq_base
            .load(Ordering::SeqCst)
            .wrapping_add(irq & 7)
    }

    /// Latch a request for `irq` (the input line is high).
    pub fn assert_irq(&self, irq: u8) {
        self.chip(irq)
            .irr
            .fetch_or(1 << (irq & 7), Ordering::SeqCst);
    }

    /// Drop the request for `irq` (the input line went low).
    pub fn deassert_irq(&self, irq: u8) {
        self.chip(irq)
            .irr
            .fetch_and(!(1 << (irq & 7)), Ordering::SeqCst);
    }

    /// Whether a request for `irq` is latched.
    pub fn irr_test(&self, irq: u8) -> bool {
        self.chip(irq).irr.load(Ordering::SeqCst) & (1 << (irq & 7)) != 0
    }

    fn state_for_port(&self, port: Port) -> &PicState {
        match port {
            Self::PIC_MASTER_COMMAND | Self::PIC_MASTER_DATA => &self.master,
            _ => &self.slave,
        }
    }

    fn on_port_read(&self, port: Port, mut val: PortReadRequest) -> Result<()> {
        match port {
            Self::PIC_MASTER_DATA | Self::PIC_SLAVE_DATA => {
                let imr = self.state_for_port(port).imr.load(Ordering::SeqCst);
                val.copy_from_u32(imr as u32);
            }
            _ => (),
        }
        Ok(())
    }

    fn on_port_write(&self, port: Port, val: PortWriteRequest) -> Result<()> {
        let val: u8 = val.try_into()?;
        let state = self.state_for_port(port);
        match port {
            Self::PIC_MASTER_COMMAND | Self::PIC_SLAVE_COMMAND => {
                if val & Self::ICW1_INIT != 0 {
                    state.init_state.store(1, Ordering::SeqCst);
                    state.imr.store(0, Ordering::SeqCst);
                }
                // OCW2/OCW3 (EOI, read selects) are not modeled
            }
            Self::PIC_MASTER_DATA | Self::PIC_SLAVE_DATA => {
                if state.init_state.swap(0, Ordering::SeqCst) != 0 {
                    // ICW2: vector base. ICW3/ICW4 of the init sequence are
                    // accepted but ignored.
                    state.irq_base.store(val & 0xf8, Ordering::SeqCst);
                } else {
                    state.imr.store(val, Ordering::SeqCst);
                }
            }
            _ => (),
        }
        Ok(())
    }
}

impl EmulatedDevice for Pic8259 {
    fn services(&self) -> Vec<DeviceRegion> {
        vec![
            DeviceRegion::PortIo(
                Self::PIC_MASTER_COMMAND..=Self::PIC_MASTER_DATA,
            ),
            DeviceRegion::PortIo(Self::PIC_SLAVE_COMMAND..=Self::PIC_SLAVE_DATA),
        ]
    }

    fn on_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::PortRead(port, val) => self.on_port_read(port, val),
            DeviceEvent::PortWrite(port, val) => self.on_port_write(port, val),
        }
    }
}
