//! Error types of the bootloader protocol core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No device could be found or opened, or the session was already closed
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The sign-on handshake did not succeed
    #[error("bootloader not in sync after {attempts} attempt(s)")]
    SyncFailure {
        attempts: u32,
        #[source]
        source: Option<Box<Error>>,
    },

    /// Length, sentinel, token or sequence number mismatch
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("checksum mismatch: expected 0x{expected:02x}, received 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("unsupported CPU with signature 0x{signature:06x}")]
    UnsupportedCpu { signature: u32 },

    /// The bootloader answered with a non-OK status
    #[error("device rejected command 0x{command:02x} with status 0x{status:02x}")]
    DeviceError { command: u8, status: u8 },

    #[error("zero-length transfer")]
    EmptyTransfer,

    #[error("transfer of {length} byte(s) at 0x{address:x} exceeds limit 0x{limit:x}")]
    OutOfRange {
        address: u32,
        length: u32,
        limit: u32,
    },

    #[error("flash address 0x{address:x} is not word aligned")]
    Misaligned { address: u32 },

    #[error("encoding error: {0}")]
    Encoding(#[from] scroll::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedResponse(reason.into())
    }

    /// Protocol level failures, as opposed to the transport going away.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::MalformedResponse(_) | Error::ChecksumMismatch { .. } | Error::DeviceError { .. }
        )
    }

    /// Wraps a failed handshake exchange; transport failures pass through untouched.
    pub(crate) fn into_sync_failure(self, attempts: u32) -> Self {
        if self.is_protocol() {
            Error::SyncFailure {
                attempts,
                source: Some(Box::new(self)),
            }
        } else {
            self
        }
    }
}
