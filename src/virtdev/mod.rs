use crate::error::{Error, Result};

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::convert::TryFrom;
use core::fmt;
use core::ops::RangeInclusive;
use spin::RwLock;

pub mod ioapic;
pub mod lapic;
pub mod pic;
pub mod pit;

pub type Port = u16;

/// A guest interaction with an emulated device
#[derive(Debug)]
pub enum DeviceEvent<'a> {
    PortRead(Port, PortReadRequest<'a>),
    PortWrite(Port, PortWriteRequest<'a>),
}

#[derive(Eq, PartialEq)]
struct PortIoRegion(RangeInclusive<Port>);

impl PartialOrd for PortIoRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Regions compare equal when they overlap, so a point lookup finds the
// region containing it and overlapping registrations collide.
impl Ord for PortIoRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.end() < other.0.start() {
            Ordering::Less
        } else if other.0.end() < self.0.start() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

pub enum DeviceRegion {
    PortIo(RangeInclusive<Port>),
}

/// A structure for looking up `EmulatedDevice`s by port
#[derive(Default)]
pub struct DeviceMap {
    portio_map: BTreeMap<PortIoRegion, Arc<RwLock<dyn EmulatedDevice>>>,
}

impl DeviceMap {
    /// Find the device servicing the given port
    pub fn find_device(
        &self,
        port: Port,
    ) -> Option<&Arc<RwLock<dyn EmulatedDevice>>> {
        let key = PortIoRegion(RangeInclusive::new(port, port));
        self.portio_map.get(&key)
    }

    pub fn register_device(
        &mut self,
        dev: Arc<RwLock<dyn EmulatedDevice>>,
    ) -> Result<()> {
        let services = dev.read().services();
        for region in services.into_iter() {
            match region {
                DeviceRegion::PortIo(val) => {
                    let key = PortIoRegion(val);
                    if self.portio_map.contains_key(&key) {
                        let conflict = self
                            .portio_map
                            .get_key_value(&key)
                            .expect("Could not get conflicting device")
                            .0;
                        return Err(Error::InvalidDevice(format!(
                            "I/O port already registered: 0x{:x}-0x{:x} conflicts with existing map of 0x{:x}-0x{:x}",
                            key.0.start(), key.0.end(), conflict.0.start(), conflict.0.end()
                        )));
                    }
                    self.portio_map.insert(key, dev.clone());
                }
            }
        }
        Ok(())
    }
}

pub trait EmulatedDevice: Send + Sync {
    fn services(&self) -> Vec<DeviceRegion>;

    fn on_event(&mut self, _event: DeviceEvent) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum PortReadRequest<'a> {
    OneByte(&'a mut [u8; 1]),
    TwoBytes(&'a mut [u8; 2]),
    FourBytes(&'a mut [u8; 4]),
}

#[derive(Debug)]
pub enum PortWriteRequest<'a> {
    OneByte(&'a [u8; 1]),
    TwoBytes(&'a [u8; 2]),
    FourBytes(&'a [u8; 4]),
}

impl<'a> PortReadRequest<'a> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            &Self::OneByte(ref val) => *val,
            &Self::TwoBytes(ref val) => *val,
            &Self::FourBytes(ref val) => *val,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            &mut Self::OneByte(ref mut val) => *val,
            &mut Self::TwoBytes(ref mut val) => *val,
            &mut Self::FourBytes(ref mut val) => *val,
        }
    }

    pub fn copy_from_u32(&mut self, val: u32) {
        let arr = val.to_be_bytes();
        let len = self.len();
        self.as_mut_slice().copy_from_slice(&arr[4 - len..]);
    }
}

impl<'a> TryFrom<&'a mut [u8]> for PortReadRequest<'a> {
    type Error = Error;

    fn try_from(buff: &'a mut [u8]) -> Result<Self> {
        let res = match buff.len() {
            1 => Self::OneByte(unsafe {
                &mut *(buff.as_mut_ptr() as *mut [u8; 1])
            }),
            2 => Self::TwoBytes(unsafe {
                &mut *(buff.as_mut_ptr() as *mut [u8; 2])
            }),
            4 => Self::FourBytes(unsafe {
                &mut *(buff.as_mut_ptr() as *mut [u8; 4])
            }),
            len => {
                return Err(Error::InvalidValue(format!(
                    "Invalid slice length: {}",
                    len
                )))
            }
        };
        Ok(res)
    }
}

impl<'a> PortWriteRequest<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        match *self {
            Self::OneByte(val) => val,
            Self::TwoBytes(val) => val,
            Self::FourBytes(val) => val,
        }
    }

    pub fn as_u32(&self) -> u32 {
        let arr = match self {
            Self::OneByte(val) => [0, 0, 0, val[0]],
            Self::TwoBytes(val) => [0, 0, val[0], val[1]],
            Self::FourBytes(val) => *val.clone(),
        };
        u32::from_be_bytes(arr)
    }
}

impl<'a> TryFrom<&'a [u8]> for PortWriteRequest<'a> {
    type Error = Error;

    fn try_from(buff: &'a [u8]) -> Result<Self> {
        let res = match buff.len() {
            1 => Self::OneByte(unsafe { &*(buff.as_ptr() as *const [u8; 1]) }),
            2 => Self::TwoBytes(unsafe { &*(buff.as_ptr() as *const [u8; 2]) }),
            4 => {
                Self::FourBytes(unsafe { &*(buff.as_ptr() as *const [u8; 4]) })
            }
            len => {
                return Err(Error::InvalidValue(format!(
                    "Invalid slice length: {}",
                    len
                )))
            }
        };
        Ok(res)
    }
}

impl<'a> TryFrom<PortWriteRequest<'a>> for u8 {
    type Error = Error;

    fn try_from(value: PortWriteRequest<'a>) -> Result<Self> {
        match value {
            PortWriteRequest::OneByte(val) => Ok(val[0]),
            val => Err(Error::InvalidValue(format!(
                "Value {} cannot be converted to u8",
                val
            ))),
        }
    }
}

impl<'a> TryFrom<PortWriteRequest<'a>> for u32 {
    type Error = Error;

    fn try_from(value: PortWriteRequest<'a>) -> Result<Self> {
        match value {
            PortWriteRequest::FourBytes(val) => Ok(u32::from_be_bytes(*val)),
            val => Err(Error::InvalidValue(format!(
                "Value {} cannot be converted to u32",
                val
            ))),
        }
    }
}

impl<'a> fmt::Display for PortWriteRequest<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneByte(arr) => {
                write!(f, "PortWriteRequest([0x{:x}])", arr[0])
            }
            Self::TwoBytes(arr) => {
                write!(f, "PortWriteRequest([0x{:x}, 0x{:x}])", arr[0], arr[1])
            }
            Self::FourBytes(arr) => write!(
                f,
                "PortWriteRequest([0x{:x}, 0x{:x}, 0x{:x}, 0x{:x}])",
                arr[0], arr[1], arr[2], arr[3]
            ),
        }
    }
}
