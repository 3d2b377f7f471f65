//! STK500 v1: one command byte, parameters, then `CRC_EOP`.
//!
//! Replies are framed by `RESP_STK_IN_SYNC` .. `RESP_STK_OK`. There is no
//! sequence numbering; ordering relies on strict request/response turns.

use std::time::Duration;

use scroll::{BE, LE, Pwrite};

use super::{Bootloader, Identification, Memory, programmer_name};
use crate::constants::stk500v1::{commands, params, *};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// IN_SYNC, "AVR ISP", OK
const SIGN_ON_WINDOW: usize = 9;

/// STK500 v1 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    GetSync,
    /// Not implemented faithfully by Optiboot, which always answers IN_SYNC OK
    GetSignOn,
    GetParameter(u8),
    ReadSignature,
    /// Word address for flash, byte address for EEPROM
    LoadAddress(u16),
    ProgramPage { memory: Memory, data: &'a [u8] },
    ReadPage { memory: Memory, length: u16 },
    LeaveProgMode,
}

impl Command<'_> {
    pub const fn code(&self) -> u8 {
        match self {
            Command::GetSync => commands::GET_SYNC,
            Command::GetSignOn => commands::GET_SIGN_ON,
            Command::GetParameter(_) => commands::GET_PARAMETER,
            Command::ReadSignature => commands::READ_SIGN,
            Command::LoadAddress(_) => commands::LOAD_ADDRESS,
            Command::ProgramPage { .. } => commands::PROG_PAGE,
            Command::ReadPage { .. } => commands::READ_PAGE,
            Command::LeaveProgMode => commands::LEAVE_PROGMODE,
        }
    }

    /// Expected reply size, sentinels included.
    pub const fn response_len(&self) -> usize {
        match self {
            Command::GetSignOn => SIGN_ON_WINDOW,
            Command::GetParameter(_) => 3,
            Command::ReadSignature => 5,
            Command::ReadPage { length, .. } => *length as usize + 2,
            _ => 2,
        }
    }

    pub fn into_raw(self) -> Result<Vec<u8>> {
        let code = self.code();
        match self {
            Command::GetParameter(param) => Ok(vec![code, param, CRC_EOP]),
            Command::LoadAddress(address) => {
                let mut buf = [code, 0, 0, CRC_EOP];
                buf.pwrite_with(address, 1, LE)?;
                Ok(buf.to_vec())
            }
            Command::ProgramPage { memory, data } => {
                let length = u16::try_from(data.len()).map_err(|_| Error::OutOfRange {
                    address: 0,
                    length: data.len() as u32,
                    limit: u16::MAX as u32,
                })?;
                // CMD, SIZE, MEMTYPE, DATA, EOP
                let mut buf = vec![0u8; 4 + data.len() + 1];
                buf[0] = code;
                buf.pwrite_with(length, 1, BE)?;
                buf[3] = memtype(memory);
                buf[4..4 + data.len()].copy_from_slice(data);
                buf[4 + data.len()] = CRC_EOP;
                Ok(buf)
            }
            Command::ReadPage { memory, length } => {
                let mut buf = [code, 0, 0, memtype(memory), CRC_EOP];
                buf.pwrite_with(length, 1, BE)?;
                Ok(buf.to_vec())
            }
            _ => Ok(vec![code, CRC_EOP]),
        }
    }
}

const fn memtype(memory: Memory) -> u8 {
    match memory {
        Memory::Flash => MEMTYPE_FLASH,
        Memory::Eeprom => MEMTYPE_EEPROM,
    }
}

/// How strictly a reply is checked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Check {
    /// Only the sentinels, any length
    Loose,
    /// Sentinels and the exact expected length
    Strict,
}

/// Validates a raw reply and returns what lies between the sentinels.
pub fn validate(command: u8, answer: &[u8], expected_len: usize, check: Check) -> Result<&[u8]> {
    let (first, last) = match answer {
        [first, .., last] => (*first, *last),
        _ => {
            return Err(Error::malformed(format!(
                "short reply to '{}': {} byte(s)",
                command as char,
                answer.len()
            )));
        }
    };
    if first != RESP_STK_IN_SYNC {
        return Err(Error::malformed(format!("not in sync, got 0x{:02x}", first)));
    }
    if last == RESP_STK_FAILED {
        return Err(Error::DeviceError {
            command,
            status: RESP_STK_FAILED,
        });
    }
    if last != RESP_STK_OK {
        return Err(Error::malformed(format!("missing OK, got 0x{:02x}", last)));
    }
    if check == Check::Strict && answer.len() != expected_len {
        return Err(Error::malformed(format!(
            "expected {} byte(s), got {}",
            expected_len,
            answer.len()
        )));
    }
    Ok(&answer[1..answer.len() - 1])
}

/// Retry policy of the initial handshake, the only retried exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub attempts: u32,
    /// Read timeout while the line may still carry reset noise
    pub attempt_timeout: Duration,
    /// Read timeout once in sync
    pub steady_timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            attempts: 4,
            attempt_timeout: Duration::from_millis(500),
            steady_timeout: Duration::from_millis(1000),
        }
    }
}

pub struct Stk500v1<T: Transport> {
    transport: T,
    policy: SyncPolicy,
}

impl<T: Transport> Stk500v1<T> {
    pub fn new(transport: T, policy: SyncPolicy) -> Self {
        Stk500v1 { transport, policy }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn transact(&mut self, cmd: Command<'_>, check: Check) -> Result<Vec<u8>> {
        let code = cmd.code();
        let expected_len = cmd.response_len();
        let answer = self.transport.transfer(&cmd.into_raw()?, expected_len)?;
        validate(code, &answer, expected_len, check).map(<[u8]>::to_vec)
    }

    fn get_parameter(&mut self, param: u8) -> Result<u8> {
        let value = self.transact(Command::GetParameter(param), Check::Strict)?;
        Ok(value[0])
    }

    fn load_address(&mut self, memory: Memory, byte_address: u32) -> Result<()> {
        let address =
            u16::try_from(memory.wire_address(byte_address)).map_err(|_| Error::OutOfRange {
                address: byte_address,
                length: 0,
                limit: match memory {
                    Memory::Flash => 0x2_0000,
                    Memory::Eeprom => 0x1_0000,
                },
            })?;
        self.transact(Command::LoadAddress(address), Check::Strict)?;
        Ok(())
    }
}

impl<T: Transport> Bootloader for Stk500v1<T> {
    fn synchronize(&mut self) -> Result<()> {
        self.transport.set_timeout(self.policy.attempt_timeout)?;

        let mut last_error = None;
        for attempt in 1..=self.policy.attempts {
            if attempt > 1 {
                // a reply to the previous attempt may still be on its way
                self.transport.discard_input()?;
            }
            match self.transact(Command::GetSync, Check::Strict) {
                Ok(_) => {
                    log::debug!("in sync after {} attempt(s)", attempt);
                    self.transport.set_timeout(self.policy.steady_timeout)?;
                    return Ok(());
                }
                Err(e) if e.is_protocol() => {
                    log::debug!("sync attempt {} failed: {}", attempt, e);
                    last_error = Some(Box::new(e));
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::SyncFailure {
            attempts: self.policy.attempts,
            source: last_error,
        })
    }

    fn identify(&mut self) -> Result<Identification> {
        let hardware_version = self.get_parameter(params::HW_VER)?;
        let software_major = self.get_parameter(params::SW_MAJOR)?;
        let software_minor = self.get_parameter(params::SW_MINOR)?;

        let name = self.transact(Command::GetSignOn, Check::Loose)?;

        Ok(Identification {
            hardware_version,
            software_major,
            software_minor,
            programmer_name: programmer_name(&name),
        })
    }

    fn read_signature(&mut self) -> Result<u32> {
        let sig = self.transact(Command::ReadSignature, Check::Strict)?;
        Ok((sig[0] as u32) << 16 | (sig[1] as u32) << 8 | sig[2] as u32)
    }

    fn write_page(&mut self, memory: Memory, byte_address: u32, data: &[u8]) -> Result<()> {
        self.load_address(memory, byte_address)?;
        self.transact(Command::ProgramPage { memory, data }, Check::Strict)?;
        Ok(())
    }

    fn read_page(&mut self, memory: Memory, byte_address: u32, length: u16) -> Result<Vec<u8>> {
        self.load_address(memory, byte_address)?;
        self.transact(Command::ReadPage { memory, length }, Check::Strict)
    }

    fn leave_programming_mode(&mut self) -> Result<()> {
        self.transact(Command::LeaveProgMode, Check::Strict)?;
        Ok(())
    }
}
