//! Reboot dispatch for running or BOOTSEL-mode devices.
//!
//! Preference order follows what the device exposes: a BOOTSEL reboot wants
//! the stdio reset interface (a device already in BOOTSEL has nothing to
//! do), while a normal reboot prefers PICOBOOT and falls back to the reset
//! interface.

use rusb::UsbContext;

use crate::error::Result;
use crate::memmap::TargetID;
use crate::usb::DeviceMatch;
use crate::{RESET_REQUEST_BOOTSEL, RESET_REQUEST_FLASH};

const REBOOT_DELAY_MS: u32 = 500;

/// Where the reboot should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootTarget {
    /// Back into the flash-resident firmware.
    Normal,
    /// Into BOOTSEL mode, ready for loading.
    Bootsel,
}

/// What the dispatch ended up doing, for user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootOutcome {
    Requested,
    AlreadyInBootsel,
}

/// Sends the appropriate reboot request to a matched device.
pub fn reboot_device<T: UsbContext>(
    device: &DeviceMatch<T>,
    target: RebootTarget,
) -> Result<RebootOutcome> {
    match target {
        RebootTarget::Bootsel => {
            if device.reset.is_some() {
                log::debug!("requesting BOOTSEL via reset interface");
                let mut reset = device.open_reset()?;
                reset.send_reset_request(RESET_REQUEST_BOOTSEL)?;
                Ok(RebootOutcome::Requested)
            } else {
                // a device exposing PICOBOOT is already in BOOTSEL mode
                Ok(RebootOutcome::AlreadyInBootsel)
            }
        }
        RebootTarget::Normal => {
            if device.picoboot.is_some() {
                let mut conn = device.open_picoboot()?;
                match conn.target() {
                    TargetID::Rp2350 => conn.reboot2_normal(REBOOT_DELAY_MS)?,
                    TargetID::Rp2040 => conn.reboot(0, 0, REBOOT_DELAY_MS)?,
                }
                Ok(RebootOutcome::Requested)
            } else {
                log::debug!("no PICOBOOT interface, using reset interface");
                let mut reset = device.open_reset()?;
                reset.send_reset_request(RESET_REQUEST_FLASH)?;
                Ok(RebootOutcome::Requested)
            }
        }
    }
}
