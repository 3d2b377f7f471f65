//! The STK500 bootloader protocols.
//!
//! Both dialects expose the same capabilities through [`Bootloader`]; they
//! differ only in how requests are framed on the wire.

use std::{fmt, str::FromStr};

use clap::{ValueEnum, builder::PossibleValue};

use crate::error::Result;

pub use self::stk500v1::Stk500v1;
pub use self::stk500v2::Stk500v2;

pub mod stk500v1;
pub mod stk500v2;

/// Protocol dialect spoken by the bootloader.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Sentinel delimited, used by Nano/Uno class boards
    Stk500v1,
    /// Framed and checksummed, used by the Mega boards
    Stk500v2,
}

impl Protocol {
    pub const fn name(&self) -> &'static str {
        match self {
            Protocol::Stk500v1 => "Stk500v1",
            Protocol::Stk500v2 => "Stk500v2",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stk500v1" | "arduino" => Ok(Protocol::Stk500v1),
            "stk500v2" | "wiring" => Ok(Protocol::Stk500v2),
            _ => Err(format!("unsupported programmer protocol: {}", s)),
        }
    }
}

impl ValueEnum for Protocol {
    fn value_variants<'a>() -> &'a [Self] {
        &[Protocol::Stk500v1, Protocol::Stk500v2]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Protocol::Stk500v1 => {
                Some(PossibleValue::new("Stk500v1").aliases(["stk500v1", "arduino"]))
            }
            Protocol::Stk500v2 => {
                Some(PossibleValue::new("Stk500v2").aliases(["stk500v2", "wiring"]))
            }
        }
    }
}

/// Target memory space. Callers always address it in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Memory {
    Flash,
    Eeprom,
}

impl Memory {
    /// Flash is word addressed on the wire, EEPROM byte addressed.
    pub const fn wire_address(self, byte_address: u32) -> u32 {
        match self {
            Memory::Flash => byte_address >> 1,
            Memory::Eeprom => byte_address,
        }
    }

    pub const fn is_flash(self) -> bool {
        matches!(self, Memory::Flash)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Memory::Flash => f.write_str("flash"),
            Memory::Eeprom => f.write_str("eeprom"),
        }
    }
}

/// What the bootloader reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identification {
    pub hardware_version: u8,
    pub software_major: u8,
    pub software_minor: u8,
    pub programmer_name: String,
}

/// Capabilities shared by both protocol engines.
///
/// Every call is one synchronous request/response exchange (or a fixed short
/// sequence of them); nothing is retried except the v1 handshake.
pub trait Bootloader {
    /// Sign-on handshake. Safe to repeat.
    fn synchronize(&mut self) -> Result<()>;

    fn identify(&mut self) -> Result<Identification>;

    /// Raw 24-bit device signature.
    fn read_signature(&mut self) -> Result<u32>;

    fn write_page(&mut self, memory: Memory, byte_address: u32, data: &[u8]) -> Result<()>;

    fn read_page(&mut self, memory: Memory, byte_address: u32, length: u16) -> Result<Vec<u8>>;

    /// Starts the application. Last command of a session.
    fn leave_programming_mode(&mut self) -> Result<()>;
}

/// Strips NULs and non-printable bytes some bootloaders pad their name with.
pub(crate) fn programmer_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}
