#![deny(missing_docs)]

//! # Physical core identifiers
//!
//! A `CoreId` names one physical CPU of the host. Guest CPUs are bound
//! to a `CoreId` for host-timer servicing and may be rebound when the
//! scheduler moves them.

use core::fmt;

/// Identifier of a physical CPU on the host
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct CoreId {
    /// The raw sequential index of the core
    pub raw: u32,
}

impl From<u32> for CoreId {
    fn from(value: u32) -> Self {
        CoreId { raw: value }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
