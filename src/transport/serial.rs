//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};

use super::Transport;
use crate::error::{Error, Result};

const SERIAL_TIMEOUT_MS: u64 = 1000;

/// USB-serial bridges found on Arduino-class boards: CH340, Uno (16U2).
const KNOWN_ADAPTERS: &[(u16, u16)] = &[(0x1a86, 0x7523), (0x2341, 0x0043)];

pub struct SerialTransport {
    serial_port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Finds the first port whose USB adapter is a known Arduino bridge.
    pub fn find_arduino_port() -> Result<String> {
        let ports = serialport::available_ports()?;

        ports
            .into_iter()
            .find(|p| match &p.port_type {
                SerialPortType::UsbPort(info) => KNOWN_ADAPTERS.contains(&(info.vid, info.pid)),
                _ => false,
            })
            .map(|p| p.port_name)
            .ok_or_else(|| Error::TransportUnavailable("no Arduino serial adapter found".into()))
    }

    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let timeout = Duration::from_millis(SERIAL_TIMEOUT_MS);
        let serial_port = serialport::new(port, baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::TransportUnavailable(format!("{}: {}", port, e)))?;
        Ok(SerialTransport {
            serial_port: Some(serial_port),
            timeout,
        })
    }

    pub fn open_any(baudrate: u32) -> Result<Self> {
        let port = Self::find_arduino_port()?;
        Self::open(&port, baudrate)
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.serial_port
            .as_mut()
            .ok_or_else(|| Error::TransportUnavailable("serial port closed".into()))
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let port = self.port()?;

        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len && Instant::now() < deadline {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port()?.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        let port = self.port()?;
        port.write_data_terminal_ready(dtr)?;
        port.write_request_to_send(rts)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(port) = self.serial_port.take() {
            log::debug!("Closing serial port {:?}", port.name());
        }
    }
}
