//! Wire constants of the two STK500 dialects.

/// STK500 v1, as spoken by the `arduino` bootloaders (ATmegaBOOT, Optiboot).
pub mod stk500v1 {
    /// Every request ends with this byte.
    pub const CRC_EOP: u8 = 0x20;

    pub const RESP_STK_OK: u8 = 0x10;
    pub const RESP_STK_FAILED: u8 = 0x11;
    pub const RESP_STK_IN_SYNC: u8 = 0x14;

    pub mod commands {
        pub const GET_SYNC: u8 = b'0';
        pub const GET_SIGN_ON: u8 = b'1';
        pub const GET_PARAMETER: u8 = b'A';
        pub const LOAD_ADDRESS: u8 = b'U';
        pub const LEAVE_PROGMODE: u8 = b'Q';
        pub const PROG_PAGE: u8 = b'd';
        pub const READ_PAGE: u8 = b't';
        pub const READ_SIGN: u8 = b'u';
    }

    pub mod params {
        pub const HW_VER: u8 = 0x80;
        pub const SW_MAJOR: u8 = 0x81;
        pub const SW_MINOR: u8 = 0x82;
    }

    /// Memory type selector of the page commands.
    pub const MEMTYPE_FLASH: u8 = b'F';
    pub const MEMTYPE_EEPROM: u8 = b'E';
}

/// STK500 v2, as spoken by the `wiring` bootloader of the Mega boards.
pub mod stk500v2 {
    /// ESC
    pub const MESSAGE_START: u8 = 0x1b;
    pub const TOKEN: u8 = 0x0e;
    /// start, sequence, length (2), token
    pub const HEADER_LEN: usize = 5;
    /// Stale bytes tolerated before the start marker of a reply.
    pub const MAX_START_SCAN: usize = 10;

    pub const STATUS_CMD_OK: u8 = 0x00;

    pub mod commands {
        pub const SIGN_ON: u8 = 0x01;
        pub const GET_PARAMETER: u8 = 0x03;
        pub const LOAD_ADDRESS: u8 = 0x06;
        pub const LEAVE_PROGMODE_ISP: u8 = 0x11;
        pub const PROGRAM_FLASH_ISP: u8 = 0x13;
        pub const READ_FLASH_ISP: u8 = 0x14;
        pub const PROGRAM_EEPROM_ISP: u8 = 0x15;
        pub const READ_EEPROM_ISP: u8 = 0x16;
        pub const SPI_MULTI: u8 = 0x1d;
    }

    pub mod params {
        pub const HW_VER: u8 = 0x90;
        pub const SW_MAJOR: u8 = 0x91;
        pub const SW_MINOR: u8 = 0x92;
    }

    /// ISP "read signature byte" instruction, tunnelled through `SPI_MULTI`.
    pub const SPI_READ_SIGNATURE: u8 = 0x30;
    /// Set on the high address byte by `LOAD_ADDRESS`.
    pub const LOAD_ADDRESS_FLAG: u32 = 0x8000_0000;
}
