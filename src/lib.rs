//! Host side of the STK500 v1/v2 bootloader protocols used by AVR boards.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod protocol;
pub mod session;
pub mod transport;

pub use self::device::CpuDescriptor;
pub use self::error::{Error, Result};
pub use self::flashing::Flashing;
pub use self::protocol::{Bootloader, Identification, Memory, Protocol};
pub use self::session::{Options, Session};
pub use self::transport::Transport;
