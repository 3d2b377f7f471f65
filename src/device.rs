//! AVR CPU registry, keyed by the 3-byte device signature.
use crate::error::{Error, Result};

/// Represents an AVR CPU as far as the bootloader is concerned
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CpuDescriptor {
    /// SIG1 << 16 | SIG2 << 8 | SIG3
    pub signature: u32,
    pub name: String,
    /// Flash page size in bytes, 0 for unknown CPUs
    pub page_size: u32,
    pub page_count: u32,
    pub eeprom_size: u32,
}

struct Entry {
    signature: u32,
    name: &'static str,
    page_size: u32,
    page_count: u32,
    eeprom_size: u32,
}

const fn cpu(
    signature: u32,
    name: &'static str,
    page_size: u32,
    page_count: u32,
    eeprom_size: u32,
) -> Entry {
    Entry {
        signature,
        name,
        page_size,
        page_count,
        eeprom_size,
    }
}

static CPUS: &[Entry] = &[
    cpu(0x1e9608, "ATmega640", 256, 1024, 4096),
    cpu(0x1e9802, "ATmega2561", 256, 1024, 4096),
    cpu(0x1e9801, "ATmega2560", 256, 1024, 4096),
    cpu(0x1e9703, "ATmega1280", 256, 512, 4096),
    cpu(0x1e9705, "ATmega1284P", 256, 512, 4096),
    cpu(0x1e9704, "ATmega1281", 256, 512, 4096),
    cpu(0x1e9782, "AT90USB1287", 256, 512, 4096),
    cpu(0x1e9702, "ATmega128", 256, 512, 4096),
    cpu(0x1e9602, "ATmega64", 256, 256, 2048),
    cpu(0x1e9502, "ATmega32", 128, 256, 1024),
    cpu(0x1e9403, "ATmega16", 128, 128, 512),
    cpu(0x1e9307, "ATmega8", 64, 128, 512),
    cpu(0x1e930a, "ATmega88", 64, 128, 512),
    cpu(0x1e9406, "ATmega168", 128, 256, 512),
    cpu(0x1e950f, "ATmega328P", 128, 256, 1024),
    cpu(0x1e9514, "ATmega328", 128, 256, 1024),
    cpu(0x1e9404, "ATmega162", 128, 128, 512),
    cpu(0x1e9402, "ATmega163", 128, 128, 512),
    cpu(0x1e9405, "ATmega169", 128, 128, 512),
    cpu(0x1e9306, "ATmega8515", 64, 128, 512),
    cpu(0x1e9308, "ATmega8535", 64, 128, 512),
];

/// Resolves a signature. Never fails: unknown parts come back with zero page
/// geometry and a name carrying the raw signature.
pub fn lookup(signature: u32) -> CpuDescriptor {
    match CPUS.iter().find(|c| c.signature == signature) {
        Some(c) => CpuDescriptor {
            signature,
            name: c.name.to_string(),
            page_size: c.page_size,
            page_count: c.page_count,
            eeprom_size: c.eeprom_size,
        },
        None => CpuDescriptor {
            signature,
            name: format!("signature: {:06x}", signature),
            page_size: 0,
            page_count: 0,
            eeprom_size: 0,
        },
    }
}

impl CpuDescriptor {
    pub const fn flash_size(&self) -> u32 {
        self.page_size * self.page_count
    }

    pub const fn is_supported(&self) -> bool {
        self.page_size != 0
    }

    pub fn ensure_supported(&self) -> Result<&Self> {
        if self.is_supported() {
            Ok(self)
        } else {
            Err(Error::UnsupportedCpu {
                signature: self.signature,
            })
        }
    }
}

impl ::std::fmt::Display for CpuDescriptor {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:06x})", self.name, self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_signature() {
        let cpu = lookup(0x1e950f);
        assert_eq!(cpu.name, "ATmega328P");
        assert_eq!(cpu.page_size, 128);
        assert_eq!(cpu.page_count, 256);
        assert_eq!(cpu.flash_size(), 32 * 1024);
        assert!(cpu.ensure_supported().is_ok());
        assert_eq!(cpu.to_string(), "ATmega328P(0x1e950f)");
    }

    #[test]
    fn every_entry_resolves_to_itself() {
        for entry in CPUS {
            let cpu = lookup(entry.signature);
            assert_eq!(cpu.name, entry.name);
            assert_eq!(cpu.page_size, entry.page_size);
            assert_eq!(cpu.page_count, entry.page_count);
            assert!(cpu.is_supported());
        }
    }

    #[test]
    fn signatures_are_unique() {
        for (i, a) in CPUS.iter().enumerate() {
            assert!(CPUS[i + 1..].iter().all(|b| b.signature != a.signature), "{}", a.name);
        }
    }

    #[test]
    fn unknown_signature() {
        let cpu = lookup(0xffffff);
        assert!(cpu.name.contains("ffffff"));
        assert_eq!(cpu.page_size, 0);
        assert_eq!(cpu.page_count, 0);
        assert!(!cpu.is_supported());
        assert!(matches!(
            cpu.ensure_supported(),
            Err(Error::UnsupportedCpu { signature: 0xffffff })
        ));
    }

    #[test]
    fn unknown_name_is_zero_padded() {
        assert_eq!(lookup(0x00_0102).name, "signature: 000102");
    }
}
