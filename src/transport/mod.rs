//! Abstract byte-stream transport interface.
use std::{thread::sleep, time::Duration};

use crate::error::Result;

pub use self::serial::SerialTransport;

mod serial;

#[cfg(test)]
pub(crate) mod mock;

/// Abstraction of the link to the bootloader.
/// Usually a USB-serial adapter with DTR/RTS wired to the reset pin.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Reads up to `max_len` bytes. Returns fewer when the read timeout elapses.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()>;
    fn discard_input(&mut self) -> Result<()>;
    /// Releases the underlying device. Any later call fails.
    fn close(&mut self);

    fn transfer(&mut self, request: &[u8], response_len: usize) -> Result<Vec<u8>> {
        log::trace!("=> {}", hex::encode(request));
        self.write(request)?;

        let resp = self.read(response_len)?;
        log::trace!("<= {}", hex::encode(&resp));
        Ok(resp)
    }

    /// Pulses DTR/RTS to reset the target into its bootloader, then drops
    /// whatever the reset left in the receive buffer.
    fn reset(&mut self, settle: Duration) -> Result<()> {
        // asserting the lines discharges the auto-reset capacitor
        self.set_control_lines(true, true)?;
        sleep(settle);
        self.set_control_lines(false, false)?;
        sleep(settle);

        self.discard_input()
    }
}
