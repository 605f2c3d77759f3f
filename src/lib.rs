//! Loading ELF images onto Raspberry Pi microcontrollers in BOOTSEL mode
//! over USB.
//!
//! An RP2040 or RP2350 held in BOOTSEL mode exposes the PICOBOOT vendor USB
//! interface, which accepts commands to erase flash, write memory and start
//! execution. This crate parses a 32-bit little-endian ARM ELF, plans where
//! each loadable segment goes (on-chip SRAM or external flash), and drives
//! the PICOBOOT protocol to carry the plan out. A running device that still
//! exposes the stdio-USB reset interface can also be rebooted back into
//! BOOTSEL mode.
//!
//! The crate ships two binaries built on the library: `picoload` (load an
//! ELF, optionally execute it) and `picoreboot` (reboot a device, optionally
//! into BOOTSEL mode).
//!
//! Parsing ([`elf`]) and planning ([`plan`]) are pure and never touch USB;
//! everything device-facing goes through [`usb::PicobootConnection`].

/// RP MCU memory address for the start of flash storage
pub const FLASH_START: u32 = 0x10000000;
/// RP2040 memory address for the end of flash storage
pub const FLASH_END_RP2040: u32 = 0x11000000;
/// RP2350 memory address for the end of flash storage
pub const FLASH_END_RP2350: u32 = 0x14000000;

/// RP MCU memory address for the start of SRAM storage
pub const SRAM_START: u32 = 0x20000000;
/// RP2040 memory address for the end of SRAM storage
pub const SRAM_END_RP2040: u32 = 0x20042000;
/// RP2350 memory address for the end of SRAM storage
pub const SRAM_END_RP2350: u32 = 0x20082000;

/// RP MCU flash page size (for writing)
pub const PAGE_SIZE: u32 = 0x100;
/// RP MCU flash sector size (for erasing)
pub const SECTOR_SIZE: u32 = 0x1000;

/// RP USB Vendor ID
pub const PICOBOOT_VID: u16 = 0x2E8A;
/// RP2040 USB Product ID in BOOTSEL mode
pub const PICOBOOT_PID_RP2040: u16 = 0x0003;
/// RP2350 USB Product ID in BOOTSEL mode
pub const PICOBOOT_PID_RP2350: u16 = 0x000f;
/// RP2040 USB Product ID when running stdio-USB firmware
pub const STDIO_PID_RP2040: u16 = 0x000a;
/// RP2350 USB Product ID when running stdio-USB firmware
pub const STDIO_PID_RP2350: u16 = 0x0009;

/// RP MCU magic number for USB interfacing
pub const PICOBOOT_MAGIC: u32 = 0x431FD10B;

/// Subclass of the stdio-USB reset interface (the class is vendor, 0xFF)
pub const RESET_INTERFACE_SUBCLASS: u8 = 0x00;
/// Protocol of the stdio-USB reset interface
pub const RESET_INTERFACE_PROTOCOL: u8 = 0x01;
/// Reset-interface control request: reboot into BOOTSEL mode
pub const RESET_REQUEST_BOOTSEL: u8 = 0x01;
/// Reset-interface control request: reboot into flash-resident firmware
pub const RESET_REQUEST_FLASH: u8 = 0x02;

/// Error Module
pub mod error;
pub use error::{Error, Result};

/// ELF Reader Module
pub mod elf;
pub use elf::{ElfImage, ProgramHeader};

/// Memory Map Module
pub mod memmap;
pub use memmap::{MemoryMap, TargetID};

/// Load Planner Module
pub mod plan;
pub use plan::{LoadPlan, LoadPolicy, PlanOp, Planner};

/// Command Module
pub mod cmd;
pub use cmd::{CmdStatus, PicobootCmd, PicobootCmdId, PicobootStatus};

/// USB Connection Module
pub mod usb;
pub use usb::{DeviceMatch, DeviceSelector, PicobootConnection};

/// Load Orchestration Module
pub mod loader;
pub use loader::plan_from_elf;

/// Reboot Orchestration Module
pub mod reboot;
pub use reboot::{reboot_device, RebootOutcome, RebootTarget};
