//! Binary layout of PICOBOOT command and status frames.
//!
//! Commands travel as packed 32-byte little-endian frames; the device
//! answers status queries with a packed 16-byte frame. Layouts are fixed by
//! the RP2040/RP2350 bootrom (see section 5.5 of the RP2040 datasheet), so
//! nothing here is reinterpreted from native struct memory: every frame goes
//! through bincode's fixed-width little-endian encoding.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::PICOBOOT_MAGIC;

/// Size of a command frame on the wire.
pub const COMMAND_FRAME_SIZE: usize = 32;
/// Size of a status frame returned by `IF_CMD_STATUS`.
pub const STATUS_FRAME_SIZE: usize = 16;

/// REBOOT2 flag selecting an ordinary reboot into flash.
pub const REBOOT2_FLAG_REBOOT_TYPE_NORMAL: u32 = 0x0;

/// Command ID of commands for the PICOBOOT interface.
///
/// The top bit (0x80) of an ID on the wire marks a device-to-host data
/// phase; none of the commands this crate issues carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PicobootCmdId {
    Reboot = 0x2,
    FlashErase = 0x3,
    Write = 0x5, // either RAM or FLASH (does no erase)
    ExitXip = 0x6,
    Exec = 0x8,
    // RP2350 only
    Reboot2 = 0xA,
}

impl TryFrom<u8> for PicobootCmdId {
    type Error = ();

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::Reboot as u8 => Ok(Self::Reboot),
            x if x == Self::FlashErase as u8 => Ok(Self::FlashErase),
            x if x == Self::Write as u8 => Ok(Self::Write),
            x if x == Self::ExitXip as u8 => Ok(Self::ExitXip),
            x if x == Self::Exec as u8 => Ok(Self::Exec),
            x if x == Self::Reboot2 as u8 => Ok(Self::Reboot2),
            _ => Err(()),
        }
    }
}

/// Status codes a device can report through `IF_CMD_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PicobootStatus {
    Ok = 0,
    UnknownCmd = 1,
    InvalidCmdLength = 2,
    InvalidTransferLength = 3,
    InvalidAddress = 4,
    BadAlignment = 5,
    InterleavedWrite = 6,
    Rebooting = 7,
    UnknownError = 8,
    InvalidState = 9,
    NotPermitted = 10,
    InvalidArg = 11,
    BufferTooSmall = 12,
    PreconditionNotMet = 13,
    ModifiedData = 14,
    InvalidData = 15,
    NotFound = 16,
    UnsupportedModification = 17,
}

impl TryFrom<u32> for PicobootStatus {
    type Error = ();

    fn try_from(x: u32) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::Ok as u32 => Ok(Self::Ok),
            x if x == Self::UnknownCmd as u32 => Ok(Self::UnknownCmd),
            x if x == Self::InvalidCmdLength as u32 => Ok(Self::InvalidCmdLength),
            x if x == Self::InvalidTransferLength as u32 => Ok(Self::InvalidTransferLength),
            x if x == Self::InvalidAddress as u32 => Ok(Self::InvalidAddress),
            x if x == Self::BadAlignment as u32 => Ok(Self::BadAlignment),
            x if x == Self::InterleavedWrite as u32 => Ok(Self::InterleavedWrite),
            x if x == Self::Rebooting as u32 => Ok(Self::Rebooting),
            x if x == Self::UnknownError as u32 => Ok(Self::UnknownError),
            x if x == Self::InvalidState as u32 => Ok(Self::InvalidState),
            x if x == Self::NotPermitted as u32 => Ok(Self::NotPermitted),
            x if x == Self::InvalidArg as u32 => Ok(Self::InvalidArg),
            x if x == Self::BufferTooSmall as u32 => Ok(Self::BufferTooSmall),
            x if x == Self::PreconditionNotMet as u32 => Ok(Self::PreconditionNotMet),
            x if x == Self::ModifiedData as u32 => Ok(Self::ModifiedData),
            x if x == Self::InvalidData as u32 => Ok(Self::InvalidData),
            x if x == Self::NotFound as u32 => Ok(Self::NotFound),
            x if x == Self::UnsupportedModification as u32 => Ok(Self::UnsupportedModification),
            _ => Err(()),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
struct RangeCmd {
    addr: u32,
    size: u32,
    _unused: u64,
}

impl RangeCmd {
    fn ser(addr: u32, size: u32) -> [u8; 16] {
        let c = RangeCmd {
            addr,
            size,
            _unused: 0,
        };
        args_block(&c)
    }
}

#[derive(Serialize, Debug, Clone)]
struct AddressOnlyCmd {
    addr: u32,
    _unused: [u8; 12],
}

impl AddressOnlyCmd {
    fn ser(addr: u32) -> [u8; 16] {
        let c = AddressOnlyCmd {
            addr,
            _unused: [0; 12],
        };
        args_block(&c)
    }
}

#[derive(Serialize, Debug, Clone)]
struct RebootCmd {
    pc: u32,
    sp: u32,
    delay: u32,
    _unused: u32,
}

impl RebootCmd {
    fn ser(pc: u32, sp: u32, delay: u32) -> [u8; 16] {
        let c = RebootCmd {
            pc,
            sp,
            delay,
            _unused: 0,
        };
        args_block(&c)
    }
}

#[derive(Serialize, Debug, Clone)]
struct Reboot2Cmd {
    flags: u32,
    delay: u32,
    p0: u32,
    p1: u32,
}

impl Reboot2Cmd {
    fn ser(flags: u32, delay: u32, p0: u32, p1: u32) -> [u8; 16] {
        let c = Reboot2Cmd {
            flags,
            delay,
            p0,
            p1,
        };
        args_block(&c)
    }
}

fn args_block(value: &impl Serialize) -> [u8; 16] {
    bincode::serialize(value)
        .unwrap()
        .try_into()
        .unwrap_or_else(|v: Vec<u8>| {
            panic!("expected an args block of length 16 but it was {}", v.len())
        })
}

/// Command frame for the PICOBOOT interface.
///
/// Shorthand constructors fill in the right args variant and `bCmdSize` for
/// each command; they do not validate addresses or sizes against the device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PicobootCmd {
    /// Magic number ([`PICOBOOT_MAGIC`]) identifying the frame.
    magic: u32,
    /// Token echoed back by the device to pair commands with status.
    token: u32,
    /// Command ID; the top bit marks a device-to-host data phase.
    cmd_id: u8,
    /// Number of meaningful bytes in `args`.
    cmd_size: u8,
    /// Reserved space
    _unused: u16,
    /// Number of data-phase bytes that follow the frame (0 for
    /// command-only).
    transfer_len: u32,
    /// Command specific args, padded with zeros.
    args: [u8; 16],
}

impl PicobootCmd {
    fn new(cmd_id: PicobootCmdId, cmd_size: u8, transfer_len: u32, args: [u8; 16]) -> Self {
        PicobootCmd {
            magic: PICOBOOT_MAGIC,
            token: 0,
            cmd_id: cmd_id as u8,
            cmd_size,
            _unused: 0,
            transfer_len,
            args,
        }
    }

    pub fn set_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn cmd_id(&self) -> u8 {
        self.cmd_id
    }

    pub fn transfer_len(&self) -> u32 {
        self.transfer_len
    }

    /// True when the data phase runs device-to-host.
    pub fn is_device_to_host(&self) -> bool {
        self.cmd_id & 0x80 != 0
    }

    /// Creates an EXIT_XIP command
    pub fn exit_xip() -> Self {
        PicobootCmd::new(PicobootCmdId::ExitXip, 0, 0, [0; 16])
    }

    /// Creates a REBOOT command
    pub fn reboot(pc: u32, sp: u32, delay: u32) -> Self {
        let args = RebootCmd::ser(pc, sp, delay);
        PicobootCmd::new(PicobootCmdId::Reboot, 12, 0, args)
    }

    /// Creates a REBOOT2 command for an ordinary reboot
    pub fn reboot2_normal(delay: u32) -> Self {
        let args = Reboot2Cmd::ser(REBOOT2_FLAG_REBOOT_TYPE_NORMAL, delay, 0, 0);
        PicobootCmd::new(PicobootCmdId::Reboot2, 0x10, 0, args)
    }

    /// Creates a FLASH_ERASE command
    pub fn flash_erase(addr: u32, size: u32) -> Self {
        let args = RangeCmd::ser(addr, size);
        PicobootCmd::new(PicobootCmdId::FlashErase, 8, 0, args)
    }

    /// Creates a WRITE command; `size` bytes follow as the data phase
    pub fn write(addr: u32, size: u32) -> Self {
        let args = RangeCmd::ser(addr, size);
        PicobootCmd::new(PicobootCmdId::Write, 8, size, args)
    }

    /// Creates an EXEC command
    pub fn exec(addr: u32) -> Self {
        let args = AddressOnlyCmd::ser(addr);
        PicobootCmd::new(PicobootCmdId::Exec, 4, 0, args)
    }

    /// Encodes the frame into its 32-byte wire form.
    pub fn encode(&self) -> Result<[u8; COMMAND_FRAME_SIZE]> {
        let bytes = bincode::serialize(self).map_err(Error::CmdSerialize)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            Error::CmdSerialize(Box::new(bincode::ErrorKind::Custom(format!(
                "command frame serialized to {} bytes",
                v.len()
            ))))
        })
    }

    /// Decodes a 32-byte wire frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMMAND_FRAME_SIZE {
            return Err(Error::CmdDeserialize(Box::new(bincode::ErrorKind::Custom(
                format!("command frame must be 32 bytes, got {}", bytes.len()),
            ))));
        }
        bincode::deserialize(bytes).map_err(Error::CmdDeserialize)
    }
}

/// Status frame returned by the `IF_CMD_STATUS` control request.
#[derive(Deserialize, Debug, Clone)]
pub struct CmdStatus {
    token: u32,
    status_code: u32,
    cmd_id: u8,
    in_progress: u8,
    _unused: [u8; 6],
}

impl CmdStatus {
    /// Decodes a 16-byte status frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::CmdDeserialize)
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// The reported status, or `None` for a code this crate does not know.
    pub fn status(&self) -> Option<PicobootStatus> {
        self.status_code.try_into().ok()
    }

    pub fn status_code(&self) -> u32 {
        self.status_code
    }

    pub fn cmd_id(&self) -> u8 {
        self.cmd_id
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_32_bytes_of_little_endian() {
        let frame = PicobootCmd::flash_erase(0x1000_2000, 0x1000)
            .set_token(0x0102_0304)
            .encode()
            .unwrap();
        assert_eq!(frame.len(), COMMAND_FRAME_SIZE);
        assert_eq!(&frame[0..4], &PICOBOOT_MAGIC.to_le_bytes());
        assert_eq!(&frame[4..8], &0x0102_0304u32.to_le_bytes());
        assert_eq!(frame[8], PicobootCmdId::FlashErase as u8);
        assert_eq!(frame[9], 8); // bCmdSize for a range command
        assert_eq!(&frame[10..12], &[0, 0]); // reserved pad
        assert_eq!(&frame[12..16], &0u32.to_le_bytes()); // no data phase
        assert_eq!(&frame[16..20], &0x1000_2000u32.to_le_bytes());
        assert_eq!(&frame[20..24], &0x1000u32.to_le_bytes());
        assert!(frame[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_carries_transfer_length() {
        let frame = PicobootCmd::write(0x2000_0000, 1024).encode().unwrap();
        assert_eq!(&frame[12..16], &1024u32.to_le_bytes());
    }

    #[test]
    fn every_command_round_trips() {
        let cmds = [
            PicobootCmd::exit_xip(),
            PicobootCmd::reboot(0, 0x2004_2000, 500),
            PicobootCmd::reboot2_normal(500),
            PicobootCmd::flash_erase(0x1000_0000, 0x2000),
            PicobootCmd::write(0x2000_0100, 512),
            PicobootCmd::exec(0x2000_0000),
        ];
        for (i, cmd) in cmds.into_iter().enumerate() {
            let cmd = cmd.set_token(i as u32 + 1);
            let decoded = PicobootCmd::decode(&cmd.encode().unwrap()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(PicobootCmd::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn direction_bit_marks_device_to_host() {
        assert!(!PicobootCmd::write(0, 4).is_device_to_host());
        let mut frame = PicobootCmd::exec(0).encode().unwrap();
        frame[8] |= 0x80;
        assert!(PicobootCmd::decode(&frame).unwrap().is_device_to_host());
    }

    #[test]
    fn reboot_args_layout() {
        let frame = PicobootCmd::reboot(0x1234, 0x2004_2000, 500).encode().unwrap();
        assert_eq!(&frame[16..20], &0x1234u32.to_le_bytes());
        assert_eq!(&frame[20..24], &0x2004_2000u32.to_le_bytes());
        assert_eq!(&frame[24..28], &500u32.to_le_bytes());
    }

    #[test]
    fn cmd_ids_round_trip_through_raw_values() {
        for id in [
            PicobootCmdId::Reboot,
            PicobootCmdId::FlashErase,
            PicobootCmdId::Write,
            PicobootCmdId::ExitXip,
            PicobootCmdId::Exec,
            PicobootCmdId::Reboot2,
        ] {
            assert_eq!(PicobootCmdId::try_from(id as u8), Ok(id));
        }
        assert!(PicobootCmdId::try_from(0x7f).is_err());
    }

    #[test]
    fn status_frame_decodes() {
        let mut bytes = [0u8; STATUS_FRAME_SIZE];
        bytes[0..4].copy_from_slice(&7u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&(PicobootStatus::Rebooting as u32).to_le_bytes());
        bytes[8] = PicobootCmdId::Exec as u8;
        bytes[9] = 1;
        let status = CmdStatus::decode(&bytes).unwrap();
        assert_eq!(status.token(), 7);
        assert_eq!(status.status(), Some(PicobootStatus::Rebooting));
        assert_eq!(status.cmd_id(), PicobootCmdId::Exec as u8);
        assert!(status.in_progress());
    }

    #[test]
    fn unknown_status_code_is_none() {
        let mut bytes = [0u8; STATUS_FRAME_SIZE];
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(CmdStatus::decode(&bytes).unwrap().status(), None);
    }
}
