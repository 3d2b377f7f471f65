//! Whole-memory transfers on top of a bootloader session.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    Memory, Protocol, Session,
    session::Options,
    transport::{SerialTransport, Transport},
};

const BAR_TEMPLATE: &str = "{msg:8} [{bar:40}] {bytes}/{total_bytes}";

pub struct Flashing<T: Transport> {
    session: Session<T>,
}

impl Flashing<SerialTransport> {
    pub fn new_from_serial(
        protocol: Protocol,
        port: Option<&str>,
        baudrate: u32,
        options: &Options,
    ) -> Result<Self> {
        let session = Session::open_serial(protocol, port, baudrate, options)?;
        log::info!("AVR device initialized and ready to accept instructions");
        Flashing::new(session)
    }
}

impl<T: Transport> Flashing<T> {
    /// Identifies the bootloader and the CPU behind it. On failure the
    /// device is asked to leave programming mode and the port is released.
    pub fn new(session: Session<T>) -> Result<Self> {
        let mut flashing = Flashing { session };
        if let Err(e) = flashing.check_target() {
            flashing.abort();
            return Err(e);
        }
        Ok(flashing)
    }

    fn check_target(&mut self) -> Result<()> {
        self.session.identify()?;
        let cpu = self.session.read_cpu_signature()?;
        log::debug!("found cpu: {}", cpu);
        cpu.ensure_supported()?;
        Ok(())
    }

    pub fn session(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    pub fn dump_info(&self) -> Result<()> {
        let s = &self.session;
        log::info!(
            "Bootloader: {:?} ({}) version: {} hardware version: {}",
            s.programmer_name(),
            s.protocol(),
            s.software_version(),
            s.hardware_version()
        );
        if let Some(cpu) = s.cpu() {
            log::info!(
                "CPU: {} (Flash: {}KiB in {} pages of {} bytes, EEPROM: {} bytes)",
                cpu,
                cpu.flash_size() / 1024,
                cpu.page_count,
                cpu.page_size,
                cpu.eeprom_size
            );
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.session.page_size() as usize
    }

    fn memory_size(&self, memory: Memory) -> usize {
        match (self.session.cpu(), memory) {
            (Some(cpu), Memory::Flash) => cpu.flash_size() as usize,
            (Some(cpu), Memory::Eeprom) => cpu.eeprom_size as usize,
            (None, _) => 0,
        }
    }

    fn check_fits(&self, image: &[u8], memory: Memory) -> Result<()> {
        anyhow::ensure!(!image.is_empty(), "empty {} image", memory);
        let size = self.memory_size(memory);
        anyhow::ensure!(
            image.len() <= size,
            "image of {} bytes does not fit {} bytes of {}",
            image.len(),
            size,
            memory
        );
        Ok(())
    }

    /// Writes `image` from address 0, one page at a time. The first failed page
    /// aborts the transfer: flash content past it is unknown.
    pub fn flash(&mut self, image: &[u8], memory: Memory) -> Result<()> {
        self.check_fits(image, memory)?;
        let page_size = self.page_size();
        log::info!("Writing {}: {} bytes", memory, image.len());

        let bar = progress_bar(image.len(), "Writing")?;
        for (index, chunk) in image.chunks(page_size).enumerate() {
            let address = index * page_size;
            let mut page = chunk.to_vec();
            if memory.is_flash() {
                // keep flash writes whole pages
                page.resize(page_size, 0xff);
            }
            self.session
                .write_page(&page, address as u32, memory)
                .map_err(|e| {
                    anyhow::format_err!("writing {} at 0x{:05x}: {}", memory, address, e)
                })?;
            bar.inc(chunk.len() as u64);
        }
        bar.finish();

        log::info!("{} written", memory);
        Ok(())
    }

    /// Reads the memory back and compares it with `image`.
    pub fn verify(&mut self, image: &[u8], memory: Memory) -> Result<()> {
        self.check_fits(image, memory)?;
        let page_size = self.page_size();
        log::info!("Verifying {}: {} bytes", memory, image.len());

        let bar = progress_bar(image.len(), "Verifying")?;
        for (index, chunk) in image.chunks(page_size).enumerate() {
            let address = index * page_size;
            let read = self
                .session
                .read_page(address as u32, chunk.len() as u32, memory)
                .map_err(|e| {
                    anyhow::format_err!("reading {} at 0x{:05x}: {}", memory, address, e)
                })?;
            if let Some(offset) = chunk.iter().zip(&read).position(|(a, b)| a != b) {
                anyhow::bail!(
                    "verify failed at 0x{:05x}: expected 0x{:02x}, read 0x{:02x}",
                    address + offset,
                    chunk[offset],
                    read[offset]
                );
            }
            bar.inc(chunk.len() as u64);
        }
        bar.finish();

        log::info!("Verify OK");
        Ok(())
    }

    /// Reads a whole memory space.
    pub fn read_memory(&mut self, memory: Memory) -> Result<Vec<u8>> {
        let size = self.memory_size(memory);
        let page_size = self.page_size();
        log::info!("Reading {}: {} bytes", memory, size);

        let bar = progress_bar(size, "Reading")?;
        let mut data = Vec::with_capacity(size);
        for address in (0..size).step_by(page_size) {
            let length = page_size.min(size - address);
            let page = self
                .session
                .read_page(address as u32, length as u32, memory)
                .map_err(|e| {
                    anyhow::format_err!("reading {} at 0x{:05x}: {}", memory, address, e)
                })?;
            data.extend(page);
            bar.inc(length as u64);
        }
        bar.finish();
        Ok(data)
    }

    /// Starts the application and releases the port.
    pub fn finish(mut self) -> Result<()> {
        self.session.leave_programming_mode()?;
        self.session.close();
        log::info!("Device left programming mode");
        Ok(())
    }

    /// Best-effort cleanup after a failed transfer. The first failure is
    /// what the caller reports; a second one here is only logged.
    pub fn abort(mut self) {
        if let Err(e) = self.session.leave_programming_mode() {
            log::warn!("leave programming mode: {}", e);
        }
        self.session.close();
    }
}

fn progress_bar(len: usize, message: &'static str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(ProgressStyle::with_template(BAR_TEMPLATE)?.progress_chars("=> "));
    bar.set_message(message);
    Ok(bar)
}
