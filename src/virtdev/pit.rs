use crate::error::{Error, Result};
use crate::time;
use crate::vcpu::Vcpu;
use crate::virtdev::{
    DeviceEvent, DeviceRegion, EmulatedDevice, Port, PortReadRequest,
    PortWriteRequest,
};
use crate::vpt::{self, PeriodicTime, PtSource};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::TryFrom;
use core::time::Duration;
use spin::RwLock;

pub const PIT_COUNTER_0: Port = 0x40;
pub const PIT_COUNTER_1: Port = 0x41;
pub const PIT_COUNTER_2: Port = 0x42;
pub const PIT_MODE_CONTROL: Port = 0x43;
pub const PIT_PS2_CTRL_B: Port = 0x61;

/// One PIT input clock tick (1.193182 MHz)
pub const PIT_NS_PER_TICK: u64 = 838;

const ISA_IRQ_TIMER: u8 = 0;

#[derive(Debug)]
enum OperatingModeState {
    Mode0 {
        start_counter: Option<u16>,
        start_time: Option<time::Instant>,
    },
    Mode2 {
        start_counter: Option<u16>,
        start_time: Option<time::Instant>,
    },
}

#[derive(Debug)]
enum AccessModeState {
    LatchCount,
    LoByte,
    HiByte,
    Word { lo_byte: Option<u8> },
}

#[derive(Debug)]
struct ChannelState {
    mode: OperatingModeState,
    access: AccessModeState,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            mode: OperatingModeState::Mode0 {
                start_counter: None,
                start_time: None,
            },
            access: AccessModeState::LoByte,
        }
    }
}

/// The emulated 8254 programmable interval timer
///
/// Channel 0 output is wired to ISA IRQ 0; programming it creates (or in
/// mode 0, one-shots) a platform timer against the guest's first vcpu.
/// Channel 2 only drives the PS/2 speaker gate. Channel 1 is not supported.
pub struct Pit8254 {
    channel0: ChannelState,
    channel2: ChannelState,
    vcpu: Arc<Vcpu>,
    pt: Arc<PeriodicTime>,
}

impl Pit8254 {
    pub fn new(vcpu: Arc<Vcpu>) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Pit8254 {
            channel0: ChannelState::default(),
            channel2: ChannelState::default(),
            vcpu,
            pt: PeriodicTime::new(PtSource::Isa),
        }))
    }

    /// The platform timer driven by channel 0.
    pub fn timer(&self) -> &Arc<PeriodicTime> {
        &self.pt
    }

    fn on_port_read(&self, port: Port, mut val: PortReadRequest) -> Result<()> {
        match port {
            PIT_PS2_CTRL_B => {
                if let OperatingModeState::Mode0 {
                    start_time,
                    start_counter,
                } = self.channel2.mode
                {
                    if let (Some(start_time), Some(start_counter)) =
                        (start_time, start_counter)
                    {
                        let duration =
                            self.vcpu.vm.clock().now() - start_time;
                        let ticks =
                            duration.as_nanos() / PIT_NS_PER_TICK as u128;
                        if ticks as u16 > start_counter {
                            val.copy_from_u32(1 << 5);
                        }
                    }
                }
            }
            _ => {
                info!("PIT read from unsupported port: 0x{:x}", port);
            }
        }
        Ok(())
    }

    fn on_port_write(&mut self, port: Port, val: PortWriteRequest) -> Result<()> {
        match port {
            PIT_MODE_CONTROL => {
                let val = u8::try_from(val)?;
                let channel = (0b11000000 & val) >> 6;
                let access = (0b00110000 & val) >> 4;
                let operating = (0b00001110 & val) >> 1;

                if val & 0b00000001 != 0 {
                    return Err(Error::InvalidValue(
                        "PIT BCD mode is not supported".into(),
                    ));
                }

                let operating_state = match operating {
                    0b000 => OperatingModeState::Mode0 {
                        start_counter: None,
                        start_time: None,
                    },
                    0b010 => OperatingModeState::Mode2 {
                        start_counter: None,
                        start_time: None,
                    },
                    value => {
                        return Err(Error::InvalidValue(format!(
                            "Invalid PIT operating state '0x{:x}'",
                            value
                        )))
                    }
                };

                let access_state = match access {
                    0b00 => AccessModeState::LatchCount,
                    0b01 => AccessModeState::LoByte,
                    0b10 => AccessModeState::HiByte,
                    0b11 => AccessModeState::Word { lo_byte: None },
                    _ => unreachable!(),
                };

                let current_channel = match channel {
                    0b00 => {
                        // Reprogramming channel 0 stops the running timer
                        vpt::destroy_periodic_time(&self.pt);
                        &mut self.channel0
                    }
                    0b10 => &mut self.channel2,
                    value => {
                        return Err(Error::InvalidValue(format!(
                            "Invalid PIT channel '0x{:x}'",
                            value
                        )))
                    }
                };

                *current_channel = ChannelState {
                    mode: operating_state,
                    access: access_state,
                };
            }
            port @ PIT_COUNTER_0..=PIT_COUNTER_2 => {
                let val = u8::try_from(val)?;
                let channel_state = match port {
                    PIT_COUNTER_0 => &mut self.channel0,
                    PIT_COUNTER_1 => {
                        return Err(Error::InvalidValue(format!(
                            "Invalid PIT port '0x{:x}'",
                            port
                        )))
                    }
                    PIT_COUNTER_2 => &mut self.channel2,
                    _ => unreachable!(),
                };

                let counter = match channel_state.access {
                    AccessModeState::LoByte => val as u16,
                    AccessModeState::HiByte => (val as u16) << 8,
                    AccessModeState::Word { ref mut lo_byte } => {
                        if let Some(lo_byte) = lo_byte {
                            ((val as u16) << 8) | (*lo_byte as u16)
                        } else {
                            // Only the low byte has arrived so far
                            *lo_byte = Some(val);
                            return Ok(());
                        }
                    }
                    AccessModeState::LatchCount => return Ok(()),
                };

                if counter == 0 {
                    warn!("PIT: ignoring counter set to 0");
                    return Ok(());
                }

                let duration = Duration::from_nanos(
                    PIT_NS_PER_TICK * counter as u64,
                );
                let now = self.vcpu.vm.clock().now();

                match channel_state.mode {
                    OperatingModeState::Mode0 {
                        ref mut start_counter,
                        ref mut start_time,
                    } => {
                        *start_counter = Some(counter);
                        *start_time = Some(now);

                        // Only channel 0 produces timer interrupts
                        if port == PIT_COUNTER_0 {
                            vpt::create_periodic_time(
                                &self.vcpu,
                                &self.pt,
                                duration,
                                ISA_IRQ_TIMER,
                                true,
                                None,
                            );
                        }
                    }
                    OperatingModeState::Mode2 {
                        ref mut start_counter,
                        ref mut start_time,
                    } => {
                        *start_counter = Some(counter);
                        *start_time = Some(now);

                        if port == PIT_COUNTER_0 {
                            vpt::create_periodic_time(
                                &self.vcpu,
                                &self.pt,
                                duration,
                                ISA_IRQ_TIMER,
                                false,
                                None,
                            );
                        }
                    }
                };
            }
            _ => {
                info!("PIT: write to unsupported port: 0x{:x}", port);
            }
        }

        Ok(())
    }
}

impl EmulatedDevice for Pit8254 {
    fn services(&self) -> Vec<DeviceRegion> {
        vec![
            DeviceRegion::PortIo(PIT_COUNTER_0..=PIT_MODE_CONTROL),
            DeviceRegion::PortIo(PIT_PS2_CTRL_B..=PIT_PS2_CTRL_B),
        ]
    }

    fn on_event(&mut self, event: DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::PortRead(port, val) => self.on_port_read(port, val),
            DeviceEvent::PortWrite(port, val) => self.on_port_write(port, val),
        }
    }
}
