//! In-memory transport and simulated bootloaders for tests.
use std::{
    cell::{Ref, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use scroll::{BE, LE, Pread};

use super::Transport;
use crate::constants::{stk500v1, stk500v2};
use crate::error::{Error, Result};
use crate::protocol::stk500v2::{checksum, encode_frame};

/// Produces the bytes a device sends back for one written request.
pub trait Responder {
    fn respond(&mut self, request: &[u8]) -> Vec<u8>;

    /// Bytes that arrive only after a read has timed out.
    fn late(&mut self) -> Vec<u8> {
        Vec::new()
    }
}

pub struct MockTransport<R> {
    pub device: R,
    rx: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub timeouts: Vec<Duration>,
    pub control_lines: Vec<(bool, bool)>,
    pub discards: usize,
    pub closed: bool,
}

impl<R: Responder> MockTransport<R> {
    pub fn new(device: R) -> Self {
        MockTransport {
            device,
            rx: VecDeque::new(),
            writes: Vec::new(),
            timeouts: Vec::new(),
            control_lines: Vec::new(),
            discards: 0,
            closed: false,
        }
    }

    /// Bytes already waiting when the port is opened.
    pub fn with_pending(mut self, bytes: &[u8]) -> Self {
        self.rx.extend(bytes);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::TransportUnavailable("mock closed".into()))
        } else {
            Ok(())
        }
    }
}

impl<R: Responder> Transport for MockTransport<R> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.writes.push(data.to_vec());
        let reply = self.device.respond(data);
        self.rx.extend(reply);
        Ok(())
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let n = max_len.min(self.rx.len());
        let data: Vec<u8> = self.rx.drain(..n).collect();
        if data.len() < max_len {
            let late = self.device.late();
            self.rx.extend(late);
        }
        Ok(data)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.timeouts.push(timeout);
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.ensure_open()?;
        self.control_lines.push((dtr, rts));
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.discards += 1;
        self.rx.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Handle that keeps the mock reachable once a session owns the transport.
pub struct SharedTransport<R>(Rc<RefCell<MockTransport<R>>>);

impl<R> Clone for SharedTransport<R> {
    fn clone(&self) -> Self {
        SharedTransport(Rc::clone(&self.0))
    }
}

impl<R: Responder> SharedTransport<R> {
    pub fn new(mock: MockTransport<R>) -> Self {
        SharedTransport(Rc::new(RefCell::new(mock)))
    }

    pub fn mock(&self) -> Ref<'_, MockTransport<R>> {
        self.0.borrow()
    }
}

impl<R: Responder> Transport for SharedTransport<R> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.borrow_mut().write(data)
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.0.borrow_mut().read(max_len)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.0.borrow_mut().set_timeout(timeout)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.0.borrow_mut().set_control_lines(dtr, rts)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.0.borrow_mut().discard_input()
    }

    fn close(&mut self) {
        self.0.borrow_mut().close()
    }
}

/// Flash and EEPROM of the simulated part, sized for an ATmega2560.
struct Memories {
    flash: Vec<u8>,
    eeprom: Vec<u8>,
}

impl Default for Memories {
    fn default() -> Self {
        Memories {
            flash: vec![0xff; 256 * 1024],
            eeprom: vec![0xff; 4 * 1024],
        }
    }
}

impl Memories {
    fn space(&mut self, flash: bool) -> &mut Vec<u8> {
        if flash {
            &mut self.flash
        } else {
            &mut self.eeprom
        }
    }

    fn write(&mut self, flash: bool, address: usize, data: &[u8]) {
        self.space(flash)[address..address + data.len()].copy_from_slice(data);
    }

    fn read(&mut self, flash: bool, address: usize, len: usize) -> Vec<u8> {
        self.space(flash)[address..address + len].to_vec()
    }
}

/// Flash is addressed in words on the wire.
fn byte_address(flash: bool, address: usize) -> usize {
    if flash {
        address * 2
    } else {
        address
    }
}

/// ATmegaBOOT/Optiboot-like STK500 v1 bootloader.
pub struct V1Bootloader {
    pub signature: [u8; 3],
    /// Sync requests to drop before answering
    pub ignored_syncs: u32,
    /// Sync requests answered only after the read timed out
    pub late_syncs: u32,
    late: Vec<u8>,
    /// Answer sign-on with a bare IN_SYNC OK
    pub optiboot: bool,
    /// Send one byte less than asked on page reads
    pub truncate_reads: bool,
    /// Word address for flash, byte address for EEPROM
    address: usize,
    memories: Memories,
}

impl Default for V1Bootloader {
    fn default() -> Self {
        V1Bootloader {
            signature: [0x1e, 0x95, 0x0f],
            ignored_syncs: 0,
            late_syncs: 0,
            late: Vec::new(),
            optiboot: false,
            truncate_reads: false,
            address: 0,
            memories: Memories::default(),
        }
    }
}

impl V1Bootloader {
    pub fn flash(&self) -> &[u8] {
        &self.memories.flash
    }
}

impl Responder for V1Bootloader {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        use stk500v1::{commands, params, *};

        if request.last() != Some(&CRC_EOP) {
            return vec![];
        }
        let framed = |payload: &[u8]| {
            let mut reply = vec![RESP_STK_IN_SYNC];
            reply.extend_from_slice(payload);
            reply.push(RESP_STK_OK);
            reply
        };

        match request[0] {
            commands::GET_SYNC if self.ignored_syncs > 0 => {
                self.ignored_syncs -= 1;
                vec![]
            }
            commands::GET_SYNC if self.late_syncs > 0 => {
                self.late_syncs -= 1;
                self.late = framed(&[]);
                vec![]
            }
            commands::GET_SYNC | commands::LEAVE_PROGMODE => framed(&[]),
            commands::GET_PARAMETER => match request[1] {
                params::HW_VER => framed(&[2]),
                params::SW_MAJOR => framed(&[1]),
                params::SW_MINOR => framed(&[16]),
                _ => vec![RESP_STK_IN_SYNC, 0, RESP_STK_FAILED],
            },
            commands::GET_SIGN_ON if self.optiboot => framed(&[]),
            commands::GET_SIGN_ON => framed(b"AVR ISP"),
            commands::READ_SIGN => framed(&self.signature),
            commands::LOAD_ADDRESS => {
                self.address = request.pread_with::<u16>(1, LE).unwrap_or_default() as usize;
                framed(&[])
            }
            commands::PROG_PAGE => {
                let len = request.pread_with::<u16>(1, BE).unwrap_or_default() as usize;
                let flash = request[3] == MEMTYPE_FLASH;
                let address = byte_address(flash, self.address);
                self.memories.write(flash, address, &request[4..4 + len]);
                framed(&[])
            }
            commands::READ_PAGE => {
                let mut len = request.pread_with::<u16>(1, BE).unwrap_or_default() as usize;
                let flash = request[3] == MEMTYPE_FLASH;
                let address = byte_address(flash, self.address);
                if self.truncate_reads {
                    len -= 1;
                }
                let data = self.memories.read(flash, address, len);
                framed(&data)
            }
            _ => vec![],
        }
    }

    fn late(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.late)
    }
}

/// Wiring-like STK500 v2 bootloader.
pub struct V2Bootloader {
    pub signature: [u8; 3],
    /// Stay mute
    pub silent: bool,
    /// Added to the echoed sequence number
    pub sequence_skew: u8,
    pub corrupt_checksum: bool,
    /// Status byte of every reply
    pub status: u8,
    /// Sent once, before the first reply
    pub noise: Vec<u8>,
    /// As received by LOAD_ADDRESS, flag bit cleared
    address: usize,
    memories: Memories,
}

impl Default for V2Bootloader {
    fn default() -> Self {
        V2Bootloader {
            signature: [0x1e, 0x98, 0x01],
            silent: false,
            sequence_skew: 0,
            corrupt_checksum: false,
            status: stk500v2::STATUS_CMD_OK,
            noise: vec![],
            address: 0,
            memories: Memories::default(),
        }
    }
}

impl V2Bootloader {
    fn execute(&mut self, body: &[u8]) -> Vec<u8> {
        use stk500v2::{commands, params, *};

        let command = body[0];
        let mut reply = vec![command, self.status];
        match command {
            commands::SIGN_ON => {
                reply.push(8);
                reply.extend_from_slice(b"AVRISP_2");
            }
            commands::GET_PARAMETER => reply.push(match body[1] {
                params::HW_VER => 0x0f,
                params::SW_MAJOR => 2,
                params::SW_MINOR => 0x0a,
                _ => 0,
            }),
            commands::SPI_MULTI => {
                let index = body[6] as usize;
                reply.extend_from_slice(&[0, body[4], 0, self.signature[index], STATUS_CMD_OK]);
            }
            commands::LOAD_ADDRESS => {
                let address = body.pread_with::<u32>(1, BE).unwrap_or_default();
                self.address = (address & !LOAD_ADDRESS_FLAG) as usize;
            }
            commands::PROGRAM_FLASH_ISP | commands::PROGRAM_EEPROM_ISP => {
                let len = body.pread_with::<u16>(1, BE).unwrap_or_default() as usize;
                let flash = command == commands::PROGRAM_FLASH_ISP;
                let address = byte_address(flash, self.address);
                self.memories.write(flash, address, &body[10..10 + len]);
            }
            commands::READ_FLASH_ISP | commands::READ_EEPROM_ISP => {
                let len = body.pread_with::<u16>(1, BE).unwrap_or_default() as usize;
                let flash = command == commands::READ_FLASH_ISP;
                let address = byte_address(flash, self.address);
                reply.extend(self.memories.read(flash, address, len));
                reply.push(STATUS_CMD_OK);
            }
            _ => {}
        }
        reply
    }
}

impl Responder for V2Bootloader {
    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        use stk500v2::*;

        if self.silent || request.len() < HEADER_LEN + 2 || request[0] != MESSAGE_START {
            return vec![];
        }
        let (content, trailer) = request.split_at(request.len() - 1);
        if checksum(content) != trailer[0] || request[4] != TOKEN {
            return vec![];
        }

        let body = self.execute(&request[HEADER_LEN..request.len() - 1]);
        let sequence = request[1].wrapping_add(self.sequence_skew);
        let mut reply = std::mem::take(&mut self.noise);
        let mut frame = encode_frame(sequence, &body).unwrap_or_default();
        if self.corrupt_checksum {
            if let Some(last) = frame.last_mut() {
                *last ^= 0xff;
            }
        }
        reply.extend(frame);
        reply
    }
}
