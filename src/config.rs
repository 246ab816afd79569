#![deny(missing_docs)]

use crate::error::{Error, Result};
use crate::percore;
use crate::vpt::TimerMode;

use alloc::vec::Vec;
use core::fmt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};

/// A description of a single virtual machine configuration
#[derive(Deserialize, Debug)]
pub struct UserVmConfig {
    /// A list of core ID's (starting from 0) used by this machine
    pub cpus: Vec<percore::CoreId>,

    /// How ticks missed while a guest CPU was descheduled are compensated
    #[serde(default)]
    pub timer_mode: TimerMode,
}

/// The top level user configuration
#[derive(Deserialize, Debug)]
pub struct UserConfig {
    /// Version number for this configuration
    pub version: u64,

    /// A list of virtual machine configurations
    pub vms: Vec<UserVmConfig>,
}

/// Parse a JSON user configuration
pub fn parse_config(data: &str) -> Result<UserConfig> {
    serde_json::from_str(data)
        .map_err(|e| Error::InvalidValue(format!("{}", e)))
}

struct CoreIdVisitor;

impl<'de> Visitor<'de> for CoreIdVisitor {
    type Value = percore::CoreId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a core id")
    }

    fn visit_u64<E>(self, value: u64) -> core::result::Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok((value as u32).into())
    }
}

impl<'de> Deserialize<'de> for percore::CoreId {
    fn deserialize<D>(
        deserializer: D,
    ) -> core::result::Result<percore::CoreId, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_u64(CoreIdVisitor)
    }
}
