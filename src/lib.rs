#![cfg_attr(not(test), no_std)]

//! # Virtual platform timer emulation
//!
//! This crate implements the periodic and one-shot interrupt sources a
//! hardware-virtualized guest expects from its platform: the local APIC
//! timer, the 8254 PIT and friends. Each timer is driven by the host's
//! monotonic clock but delivered through the guest's emulated interrupt
//! controllers, with configurable compensation for ticks that elapse
//! while the guest CPU is descheduled.

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate log;

/// User configuration format
pub mod config;
pub mod error;
pub mod lock;
pub mod percore;
pub mod time;
pub mod tsc;
pub mod vcpu;
pub mod virtdev;
/// Top level virtual machine definition
pub mod vm;
pub mod vpt;

#[cfg(test)]
pub(crate) mod testutil;
