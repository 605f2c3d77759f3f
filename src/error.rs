use thiserror::Error;

use crate::cmd::PicobootStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to draw bytes from the ELF source.
    #[error("failed to read ELF image: {0}")]
    ElfRead(#[from] std::io::Error),
    /// The ELF source produced no bytes.
    #[error("ELF image is empty")]
    ElfEmpty,
    /// An ELF structural invariant does not hold.
    #[error("invalid ELF image: {0}")]
    ElfFormat(&'static str),
    /// A loadable segment has neither a physical nor a virtual address.
    #[error("ELF segment has no load address")]
    InvalidSegmentAddress,

    /// Nothing is left to load under the active policy.
    #[error("no loadable segments remain under the current policy")]
    EmptyPlan,
    /// Execution was requested but the ELF entry point is zero.
    #[error("ELF entry point is zero; cannot execute")]
    EntryInvalid,
    /// Flash entry point cannot be mirrored into SRAM.
    #[error("entry point {0:#010x} cannot be mirrored into SRAM")]
    EntryUnmappable(u32),
    /// Entry point lies outside both flash and SRAM.
    #[error("entry point {0:#010x} is not in flash or SRAM")]
    EntryOutOfRange(u32),

    /// Failed to list USB devices.
    #[error("failed to enumerate usb devices: {0}")]
    UsbEnumeration(rusb::Error),
    /// Failed to open the matched USB device.
    #[error("failed to open usb device: {0}")]
    UsbOpen(rusb::Error),
    /// Failed to claim a USB interface.
    #[error("failed to claim usb interface: {0}")]
    UsbClaim(rusb::Error),
    /// A bulk or control transfer failed.
    #[error("usb transfer failed: {0}")]
    UsbIo(rusb::Error),
    /// A bulk or control transfer hit its deadline.
    #[error("usb transfer timed out")]
    UsbTimeout,
    /// A bulk read returned fewer bytes than expected.
    #[error("bulk read did not match expected size")]
    BulkReadMismatch,
    /// A bulk write accepted fewer bytes than expected.
    #[error("bulk write did not match expected size")]
    BulkWriteMismatch,

    /// Failed to serialize a command frame.
    #[error("cmd failed to binary serialize: {0}")]
    CmdSerialize(bincode::Error),
    /// Failed to deserialize a frame from the device.
    #[error("cmd failed to binary deserialize: {0}")]
    CmdDeserialize(bincode::Error),
    /// The device acknowledged the command with a non-OK status.
    #[error("device rejected command: {status:?}")]
    CommandFailed { status: PicobootStatus },

    /// Enumeration finished without a usable device.
    #[error("no matching Raspberry Pi USB device found")]
    NoMatchingDevice,
}

impl Error {
    /// Maps a bulk/control transfer error, folding timeouts into their own
    /// kind so callers can tell a stuck device from a refused transfer.
    pub(crate) fn usb_io(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Error::UsbTimeout,
            other => Error::UsbIo(other),
        }
    }

    /// True when the failure means the device has left the bus, which the
    /// EXEC and REBOOT paths treat as success.
    pub(crate) fn is_device_gone(&self) -> bool {
        matches!(self, Error::UsbIo(rusb::Error::NoDevice))
    }
}
