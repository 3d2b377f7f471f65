//! STK500 v2 message framing.
//!
//! ```text
//! MESSAGE_START | SEQUENCE | SIZE (u16 BE) | TOKEN | BODY (SIZE bytes) | CHECKSUM
//! ```
//!
//! The body is the command byte followed by its parameters; replies echo the
//! command and add a status byte. The checksum is the XOR of every preceding
//! byte of the frame, start marker included.

use scroll::{BE, Pread, Pwrite};

use super::{Bootloader, Identification, Memory, programmer_name};
use crate::constants::stk500v2::{commands, params, *};
use crate::error::{Error, Result};
use crate::transport::Transport;

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Builds a complete frame around `body`.
pub fn encode_frame(sequence: u8, body: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(body.len()).map_err(|_| Error::OutOfRange {
        address: 0,
        length: body.len() as u32,
        limit: u16::MAX as u32,
    })?;

    let mut frame = vec![0u8; HEADER_LEN + body.len() + 1];
    frame[0] = MESSAGE_START;
    frame[1] = sequence;
    frame.pwrite_with(size, 2, BE)?;
    frame[4] = TOKEN;
    frame[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(body);

    let end = frame.len() - 1;
    frame[end] = checksum(&frame[..end]);
    Ok(frame)
}

/// Validates a 5-byte header, returning the body size it announces.
pub fn parse_header(header: &[u8], sequence: u8) -> Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(Error::malformed(format!("short header: {} byte(s)", header.len())));
    }
    if header[0] != MESSAGE_START {
        return Err(Error::malformed(format!("bad start marker 0x{:02x}", header[0])));
    }
    if header[4] != TOKEN {
        return Err(Error::malformed(format!("bad token 0x{:02x}", header[4])));
    }
    if header[1] != sequence {
        return Err(Error::malformed(format!(
            "sequence mismatch: sent {}, echoed {}",
            sequence, header[1]
        )));
    }
    Ok(header.pread_with::<u16>(2, BE)? as usize)
}

/// Checks a received frame and returns its body.
pub fn decode_frame(frame: &[u8], sequence: u8) -> Result<&[u8]> {
    let size = parse_header(frame, sequence)?;
    if frame.len() != HEADER_LEN + size + 1 {
        return Err(Error::malformed(format!(
            "frame of {} byte(s) announces a {} byte body",
            frame.len(),
            size
        )));
    }

    let (content, trailer) = frame.split_at(frame.len() - 1);
    let expected = checksum(content);
    if expected != trailer[0] {
        return Err(Error::ChecksumMismatch {
            expected,
            actual: trailer[0],
        });
    }
    Ok(&content[HEADER_LEN..])
}

/// Checks the echoed command and status of a reply body, returning the rest.
pub fn check_body(body: &[u8], command: u8) -> Result<&[u8]> {
    match body {
        [cmd, ..] if *cmd != command => Err(Error::malformed(format!(
            "reply to command 0x{:02x} while expecting 0x{:02x}",
            cmd, command
        ))),
        [_, STATUS_CMD_OK, rest @ ..] => Ok(rest),
        [_, status, ..] => Err(Error::DeviceError {
            command,
            status: *status,
        }),
        _ => Err(Error::malformed(format!("reply body of {} byte(s)", body.len()))),
    }
}

pub struct Stk500v2<T: Transport> {
    transport: T,
    /// Sequence number of the next request
    sequence: u8,
    /// Learned during sign-on
    programmer_name: Option<String>,
}

impl<T: Transport> Stk500v2<T> {
    pub fn new(transport: T) -> Self {
        Self::with_sequence(transport, 1)
    }

    pub fn with_sequence(transport: T, sequence: u8) -> Self {
        Stk500v2 {
            transport,
            sequence,
            programmer_name: None,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Sends one request and returns the reply payload after command and status.
    fn transact(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.send(command, payload)?;
        self.receive(command, sequence)
    }

    fn send(&mut self, command: u8, payload: &[u8]) -> Result<u8> {
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(command);
        body.extend_from_slice(payload);

        let sequence = self.sequence;
        let frame = encode_frame(sequence, &body)?;
        log::trace!("=> {}", hex::encode(&frame));
        self.transport.write(&frame)?;

        self.sequence = self.sequence.wrapping_add(1);
        Ok(sequence)
    }

    fn receive(&mut self, command: u8, sequence: u8) -> Result<Vec<u8>> {
        let mut frame = Vec::with_capacity(HEADER_LEN);
        for _ in 0..MAX_START_SCAN {
            match self.transport.read(1)?.first() {
                Some(&MESSAGE_START) => {
                    frame.push(MESSAGE_START);
                    break;
                }
                Some(stale) => log::trace!("dropping stale byte 0x{:02x}", stale),
                None => return Err(Error::malformed("no reply")),
            }
        }
        if frame.is_empty() {
            return Err(Error::malformed("start marker not found"));
        }

        frame.extend(self.transport.read(HEADER_LEN - 1)?);
        let size = parse_header(&frame, sequence)?;

        // body plus checksum
        let rest = self.transport.read(size + 1)?;
        if rest.len() != size + 1 {
            return Err(Error::malformed(format!(
                "expected {} byte(s), got {}",
                size + 1,
                rest.len()
            )));
        }
        frame.extend(rest);
        log::trace!("<= {}", hex::encode(&frame));

        let body = decode_frame(&frame, sequence)?;
        check_body(body, command).map(<[u8]>::to_vec)
    }

    fn sign_on(&mut self) -> Result<String> {
        let reply = self.transact(commands::SIGN_ON, &[])?;
        let (len, name) = reply
            .split_first()
            .ok_or_else(|| Error::malformed("empty sign-on reply"))?;
        let name = &name[..name.len().min(*len as usize)];
        Ok(programmer_name(name))
    }

    fn get_parameter(&mut self, param: u8) -> Result<u8> {
        let reply = self.transact(commands::GET_PARAMETER, &[param])?;
        reply
            .first()
            .copied()
            .ok_or_else(|| Error::malformed(format!("no value for parameter 0x{:02x}", param)))
    }

    /// One signature byte, through the SPI passthrough.
    fn read_signature_byte(&mut self, index: u8) -> Result<u8> {
        // numTx, numRx, rxStartAddr, then the 4-byte ISP instruction
        let payload = [0, 0, 0, SPI_READ_SIGNATURE, 0, index];
        let reply = self.transact(commands::SPI_MULTI, &payload)?;
        reply
            .get(3)
            .copied()
            .ok_or_else(|| Error::malformed(format!("signature reply of {} byte(s)", reply.len())))
    }

    fn load_address(&mut self, memory: Memory, byte_address: u32) -> Result<()> {
        let address = memory.wire_address(byte_address) | LOAD_ADDRESS_FLAG;
        let mut payload = [0u8; 4];
        payload.pwrite_with(address, 0, BE)?;
        self.transact(commands::LOAD_ADDRESS, &payload)?;
        Ok(())
    }
}

fn transfer_length(byte_address: u32, length: usize) -> Result<u16> {
    u16::try_from(length).map_err(|_| Error::OutOfRange {
        address: byte_address,
        length: length as u32,
        limit: u16::MAX as u32,
    })
}

impl<T: Transport> Bootloader for Stk500v2<T> {
    fn synchronize(&mut self) -> Result<()> {
        let name = self.sign_on().map_err(|e| e.into_sync_failure(1))?;
        log::debug!("signed on to {:?}", name);
        self.programmer_name = Some(name);
        Ok(())
    }

    fn identify(&mut self) -> Result<Identification> {
        if self.programmer_name.is_none() {
            self.synchronize()?;
        }
        let hardware_version = self.get_parameter(params::HW_VER)?;
        let software_major = self.get_parameter(params::SW_MAJOR)?;
        let software_minor = self.get_parameter(params::SW_MINOR)?;

        Ok(Identification {
            hardware_version,
            software_major,
            software_minor,
            programmer_name: self.programmer_name.clone().unwrap_or_default(),
        })
    }

    fn read_signature(&mut self) -> Result<u32> {
        let mut signature = 0u32;
        for index in 0..3 {
            signature = signature << 8 | self.read_signature_byte(index)? as u32;
        }
        Ok(signature)
    }

    fn write_page(&mut self, memory: Memory, byte_address: u32, data: &[u8]) -> Result<()> {
        let length = transfer_length(byte_address, data.len())?;
        self.load_address(memory, byte_address)?;

        // NumBytes, then mode, delay, cmd1..3, poll1..2 which the bootloader ignores
        let mut payload = vec![0u8; 9 + data.len()];
        payload.pwrite_with(length, 0, BE)?;
        payload[9..].copy_from_slice(data);

        let command = match memory {
            Memory::Flash => commands::PROGRAM_FLASH_ISP,
            Memory::Eeprom => commands::PROGRAM_EEPROM_ISP,
        };
        self.transact(command, &payload)?;
        Ok(())
    }

    fn read_page(&mut self, memory: Memory, byte_address: u32, length: u16) -> Result<Vec<u8>> {
        self.load_address(memory, byte_address)?;

        let mut payload = [0u8; 3];
        payload.pwrite_with(length, 0, BE)?;
        let command = match memory {
            Memory::Flash => commands::READ_FLASH_ISP,
            Memory::Eeprom => commands::READ_EEPROM_ISP,
        };
        let mut data = self.transact(command, &payload)?;

        // data is followed by a second status byte
        match data.pop() {
            Some(STATUS_CMD_OK) if data.len() == length as usize => Ok(data),
            Some(STATUS_CMD_OK) => Err(Error::malformed(format!(
                "read {} byte(s), expected {}",
                data.len(),
                length
            ))),
            Some(status) => Err(Error::DeviceError { command, status }),
            None => Err(Error::malformed("empty read reply")),
        }
    }

    fn leave_programming_mode(&mut self) -> Result<()> {
        // preDelay, postDelay
        self.transact(commands::LEAVE_PROGMODE_ISP, &[0, 0])?;
        Ok(())
    }
}
