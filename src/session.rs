//! Bootloader session: one open connection, one protocol engine.

use std::time::Duration;

use crate::device::{self, CpuDescriptor};
use crate::error::{Error, Result};
use crate::protocol::{
    Bootloader, Identification, Memory, Protocol, Stk500v1, Stk500v2, stk500v1::SyncPolicy,
};
use crate::transport::{SerialTransport, Transport};

/// Connection tuning. Defaults match the timing real bootloaders expect.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Options {
    /// Do not pulse DTR/RTS to reset the board on connection
    #[arg(long)]
    pub no_reset: bool,

    /// Settle time of each edge of the reset pulse
    #[arg(long, default_value_t = 50)]
    pub reset_delay_ms: u64,

    /// Sync attempts before giving up (Stk500v1)
    #[arg(long, default_value_t = 4)]
    pub sync_attempts: u32,

    /// Read timeout of each sync attempt (Stk500v1)
    #[arg(long, default_value_t = 500)]
    pub sync_timeout_ms: u64,

    /// Read timeout once connected
    #[arg(long, default_value_t = 1000)]
    pub response_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            no_reset: false,
            reset_delay_ms: 50,
            sync_attempts: 4,
            sync_timeout_ms: 500,
            response_timeout_ms: 1000,
        }
    }
}

impl Options {
    fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            attempts: self.sync_attempts,
            attempt_timeout: Duration::from_millis(self.sync_timeout_ms),
            steady_timeout: Duration::from_millis(self.response_timeout_ms),
        }
    }
}

enum Engine<T: Transport> {
    V1(Stk500v1<T>),
    V2(Stk500v2<T>),
}

impl<T: Transport> Engine<T> {
    fn bootloader(&mut self) -> &mut dyn Bootloader {
        match self {
            Engine::V1(stk) => stk,
            Engine::V2(stk) => stk,
        }
    }

    fn transport(&mut self) -> &mut T {
        match self {
            Engine::V1(stk) => stk.transport_mut(),
            Engine::V2(stk) => stk.transport_mut(),
        }
    }
}

/// An open connection to a bootloader. Owns the transport until closed.
pub struct Session<T: Transport> {
    protocol: Protocol,
    engine: Engine<T>,
    hardware_version: u8,
    software_version: (u8, u8),
    programmer_name: String,
    cpu: Option<CpuDescriptor>,
    closed: bool,
}

impl Session<SerialTransport> {
    /// Opens `port`, or the first Arduino adapter found when `None`.
    pub fn open_serial(
        protocol: Protocol,
        port: Option<&str>,
        baudrate: u32,
        options: &Options,
    ) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port, baudrate)?,
            None => SerialTransport::open_any(baudrate)?,
        };
        Self::open(protocol, transport, options)
    }
}

impl<T: Transport> Session<T> {
    /// Resets the board into its bootloader and synchronizes with it.
    pub fn open(protocol: Protocol, mut transport: T, options: &Options) -> Result<Self> {
        transport.set_timeout(Duration::from_millis(options.response_timeout_ms))?;
        if options.no_reset {
            transport.discard_input()?;
        } else {
            transport.reset(Duration::from_millis(options.reset_delay_ms))?;
        }

        let engine = match protocol {
            Protocol::Stk500v1 => Engine::V1(Stk500v1::new(transport, options.sync_policy())),
            Protocol::Stk500v2 => Engine::V2(Stk500v2::new(transport)),
        };
        let mut session = Session {
            protocol,
            engine,
            hardware_version: 0,
            software_version: (0, 0),
            programmer_name: String::new(),
            cpu: None,
            closed: false,
        };
        if let Err(e) = session.synchronize() {
            session.close();
            return Err(e);
        }
        Ok(session)
    }

    fn bootloader(&mut self) -> Result<&mut dyn Bootloader> {
        if self.closed {
            return Err(Error::TransportUnavailable("session closed".into()));
        }
        Ok(self.engine.bootloader())
    }

    pub fn synchronize(&mut self) -> Result<()> {
        self.bootloader()?.synchronize()
    }

    pub fn identify(&mut self) -> Result<Identification> {
        let id = self.bootloader()?.identify()?;
        self.hardware_version = id.hardware_version;
        self.software_version = (id.software_major, id.software_minor);
        self.programmer_name = id.programmer_name.clone();
        Ok(id)
    }

    /// Reads the device signature and resolves it. Unknown parts are not an
    /// error here; they come back with a zero page size.
    pub fn read_cpu_signature(&mut self) -> Result<CpuDescriptor> {
        let signature = self.bootloader()?.read_signature()?;
        let cpu = device::lookup(signature);
        self.cpu = Some(cpu.clone());
        Ok(cpu)
    }

    pub fn write_page(&mut self, buffer: &[u8], byte_address: u32, memory: Memory) -> Result<()> {
        self.check_transfer(byte_address, buffer.len(), memory)?;
        self.bootloader()?.write_page(memory, byte_address, buffer)
    }

    pub fn read_page(&mut self, byte_address: u32, length: u32, memory: Memory) -> Result<Vec<u8>> {
        self.check_transfer(byte_address, length as usize, memory)?;
        let length = u16::try_from(length).map_err(|_| Error::OutOfRange {
            address: byte_address,
            length,
            limit: u16::MAX as u32,
        })?;
        self.bootloader()?.read_page(memory, byte_address, length)
    }

    pub fn leave_programming_mode(&mut self) -> Result<()> {
        self.bootloader()?.leave_programming_mode()
    }

    /// Releases the transport. Closing twice is a no-op.
    pub fn close(&mut self) {
        if !self.closed {
            self.engine.transport().close();
            self.closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        self.engine.transport()
    }

    /// Rejects requests the bootloader would garble instead of refusing.
    fn check_transfer(&self, byte_address: u32, length: usize, memory: Memory) -> Result<()> {
        if length == 0 {
            return Err(Error::EmptyTransfer);
        }
        if memory.is_flash() && byte_address % 2 != 0 {
            return Err(Error::Misaligned {
                address: byte_address,
            });
        }

        let Some(cpu) = self.cpu.as_ref().filter(|cpu| cpu.is_supported()) else {
            return Ok(());
        };
        let length = length as u32;
        let out_of_range = |limit: u32| Error::OutOfRange {
            address: byte_address,
            length,
            limit,
        };
        if length > cpu.page_size {
            return Err(out_of_range(cpu.page_size));
        }
        let size = match memory {
            Memory::Flash => cpu.flash_size(),
            Memory::Eeprom => cpu.eeprom_size,
        };
        match byte_address.checked_add(length) {
            Some(end) if end <= size => Ok(()),
            _ => Err(out_of_range(size)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Decimal, as printed by the bootloader tools.
    pub fn hardware_version(&self) -> String {
        self.hardware_version.to_string()
    }

    /// "major.minor"
    pub fn software_version(&self) -> String {
        format!("{}.{}", self.software_version.0, self.software_version.1)
    }

    pub fn programmer_name(&self) -> &str {
        &self.programmer_name
    }

    pub fn cpu(&self) -> Option<&CpuDescriptor> {
        self.cpu.as_ref()
    }

    pub fn cpu_name(&self) -> &str {
        self.cpu.as_ref().map(|cpu| cpu.name.as_str()).unwrap_or_default()
    }

    pub fn page_size(&self) -> u32 {
        self.cpu.as_ref().map(|cpu| cpu.page_size).unwrap_or_default()
    }

    pub fn page_count(&self) -> u32 {
        self.cpu.as_ref().map(|cpu| cpu.page_count).unwrap_or_default()
    }
}
