//! Device discovery and the PICOBOOT transport over rusb.
//!
//! A command exchange is: 32-byte frame out on the bulk OUT endpoint, an
//! optional data phase (direction given by the command ID's top bit), then a
//! single ack byte read back on the bulk IN endpoint. When the ack does not
//! arrive, the vendor `IF_CMD_STATUS` control request tells us why.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rusb::{
    Device, DeviceHandle, Direction, InterfaceDescriptor, Recipient, RequestType, TransferType,
    UsbContext,
};

use crate::cmd::{CmdStatus, PicobootCmd, PicobootStatus, STATUS_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::memmap::TargetID;
use crate::plan::MAX_WRITE_CHUNK;
use crate::{
    PICOBOOT_PID_RP2040, PICOBOOT_PID_RP2350, PICOBOOT_VID, RESET_INTERFACE_PROTOCOL,
    RESET_INTERFACE_SUBCLASS, STDIO_PID_RP2040, STDIO_PID_RP2350,
};

/// Vendor interface request: clear stale PICOBOOT state.
const PICOBOOT_IF_RESET: u8 = 0x41;
/// Vendor interface request: fetch the status of the last command.
const PICOBOOT_IF_CMD_STATUS: u8 = 0x42;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(3000);
/// Data phases ride out flash erase latency, so they get three command
/// timeouts.
const DATA_TIMEOUT: Duration = Duration::from_millis(9000);

/// Which product IDs a run is willing to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Devices already in BOOTSEL mode; the only ones that speak PICOBOOT.
    BootselOnly,
    /// BOOTSEL devices plus running stdio-USB firmware exposing the reset
    /// interface.
    BootselOrStdio,
}

impl DeviceSelector {
    fn matches(&self, product_id: u16) -> bool {
        match self {
            DeviceSelector::BootselOnly => {
                matches!(product_id, PICOBOOT_PID_RP2040 | PICOBOOT_PID_RP2350)
            }
            DeviceSelector::BootselOrStdio => matches!(
                product_id,
                PICOBOOT_PID_RP2040 | PICOBOOT_PID_RP2350 | STDIO_PID_RP2040 | STDIO_PID_RP2350
            ),
        }
    }
}

/// The PICOBOOT interface of a matched device.
#[derive(Debug, Clone, Copy)]
pub struct PicobootInterface {
    pub interface_number: u8,
    pub ep_in: u8,
    pub ep_out: u8,
}

/// The stdio-USB reset interface of a matched device.
#[derive(Debug, Clone, Copy)]
pub struct ResetInterface {
    pub interface_number: u8,
}

/// A USB device that exposed at least one interface we can drive. Nothing
/// is opened or claimed until one of the `open_*` methods is called.
#[derive(Debug)]
pub struct DeviceMatch<T: UsbContext> {
    device: Device<T>,
    pub product_id: u16,
    pub picoboot: Option<PicobootInterface>,
    pub reset: Option<ResetInterface>,
}

impl<T: UsbContext> DeviceMatch<T> {
    pub fn target(&self) -> TargetID {
        match self.product_id {
            PICOBOOT_PID_RP2350 | STDIO_PID_RP2350 => TargetID::Rp2350,
            _ => TargetID::Rp2040,
        }
    }

    /// Opens the device and claims the PICOBOOT interface.
    pub fn open_picoboot(&self) -> Result<PicobootConnection<T>> {
        let iface = self.picoboot.ok_or(Error::NoMatchingDevice)?;
        let handle = self.open_claimed(iface.interface_number)?;
        Ok(PicobootConnection {
            handle,
            iface: iface.interface_number,
            ep_in: iface.ep_in,
            ep_out: iface.ep_out,
            cmd_token: TokenCounter::new(),
            target: self.target(),
        })
    }

    /// Opens the device and claims the stdio reset interface.
    pub fn open_reset(&self) -> Result<ResetConnection<T>> {
        let iface = self.reset.ok_or(Error::NoMatchingDevice)?;
        let handle = self.open_claimed(iface.interface_number)?;
        Ok(ResetConnection {
            handle,
            iface: iface.interface_number,
        })
    }

    fn open_claimed(&self, interface_number: u8) -> Result<DeviceHandle<T>> {
        let handle = self.device.open().map_err(Error::UsbOpen)?;
        // not supported on all hosts; claiming still works without it
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(interface_number)
            .map_err(Error::UsbClaim)?;
        Ok(handle)
    }
}

/// Scans the bus for the first Raspberry Pi device carrying a PICOBOOT or
/// stdio reset interface, without opening it.
pub fn find_device<T: UsbContext>(ctx: &T, selector: DeviceSelector) -> Result<DeviceMatch<T>> {
    let devices = ctx.devices().map_err(Error::UsbEnumeration)?;
    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() != PICOBOOT_VID || !selector.matches(desc.product_id()) {
            continue;
        }
        let config = match device.active_config_descriptor() {
            Ok(c) => c,
            Err(_) => continue,
        };

        let mut picoboot = None;
        let mut reset = None;
        for interface in config.interfaces() {
            // alt-setting 0 is the only one BOOTSEL/stdio firmware uses
            let Some(alt) = interface.descriptors().next() else {
                continue;
            };
            if alt.class_code() != 0xff {
                continue;
            }
            if alt.sub_class_code() == RESET_INTERFACE_SUBCLASS
                && alt.protocol_code() == RESET_INTERFACE_PROTOCOL
            {
                reset = Some(ResetInterface {
                    interface_number: alt.interface_number(),
                });
                continue;
            }
            if picoboot.is_none() {
                if let Some((ep_in, ep_out)) = bulk_endpoints(&alt) {
                    picoboot = Some(PicobootInterface {
                        interface_number: alt.interface_number(),
                        ep_in,
                        ep_out,
                    });
                }
            }
        }

        if picoboot.is_some() || reset.is_some() {
            log::debug!(
                "matched {:04x}:{:04x} picoboot={:?} reset={:?}",
                desc.vendor_id(),
                desc.product_id(),
                picoboot,
                reset
            );
            return Ok(DeviceMatch {
                device,
                product_id: desc.product_id(),
                picoboot,
                reset,
            });
        }
    }
    Err(Error::NoMatchingDevice)
}

fn bulk_endpoints(alt: &InterfaceDescriptor) -> Option<(u8, u8)> {
    if alt.num_endpoints() != 2 {
        return None;
    }
    let mut ep_in = None;
    let mut ep_out = None;
    for endpoint in alt.endpoint_descriptors() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            Direction::In => ep_in = Some(endpoint.address()),
            Direction::Out => ep_out = Some(endpoint.address()),
        }
    }
    Some((ep_in?, ep_out?))
}

/// Hands out strictly increasing command tokens, starting at 1.
#[derive(Debug)]
struct TokenCounter(AtomicU32);

impl TokenCounter {
    fn new() -> Self {
        TokenCounter(AtomicU32::new(1))
    }

    fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A claimed PICOBOOT interface, released on drop.
#[derive(Debug)]
pub struct PicobootConnection<T: UsbContext> {
    handle: DeviceHandle<T>,
    iface: u8,
    ep_in: u8,
    ep_out: u8,
    cmd_token: TokenCounter,
    target: TargetID,
}

impl<T: UsbContext> Drop for PicobootConnection<T> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.iface);
    }
}

impl<T: UsbContext> PicobootConnection<T> {
    pub fn target(&self) -> TargetID {
        self.target
    }

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(self.ep_in, buf, timeout)
            .map_err(Error::usb_io)
    }

    fn bulk_write(&mut self, buf: &[u8], timeout: Duration) -> Result<()> {
        let written = self
            .handle
            .write_bulk(self.ep_out, buf, timeout)
            .map_err(Error::usb_io)?;
        if written != buf.len() {
            return Err(Error::BulkWriteMismatch);
        }
        Ok(())
    }

    /// Runs one command exchange: frame, optional data phase, ack. On a
    /// missing ack the command status is polled so a device-reported
    /// failure surfaces as [`Error::CommandFailed`] instead of a bare
    /// transfer error.
    pub fn cmd(&mut self, cmd: PicobootCmd, data_out: &[u8]) -> Result<Vec<u8>> {
        let cmd = cmd.set_token(self.cmd_token.next());
        log::debug!(
            "picoboot cmd {:#04x} token={} transfer_len={}",
            cmd.cmd_id(),
            cmd.token(),
            cmd.transfer_len()
        );
        let frame = cmd.encode()?;
        self.bulk_write(&frame, COMMAND_TIMEOUT)?;

        let transfer_len = cmd.transfer_len() as usize;
        let mut response = Vec::new();
        if transfer_len != 0 {
            if cmd.is_device_to_host() {
                let mut buf = vec![0u8; transfer_len];
                let received = self.bulk_read(&mut buf, DATA_TIMEOUT)?;
                if received != transfer_len {
                    return Err(Error::BulkReadMismatch);
                }
                response = buf;
            } else {
                debug_assert_eq!(data_out.len(), transfer_len);
                self.bulk_write(data_out, DATA_TIMEOUT)?;
            }
        }

        // ack byte always travels on the IN endpoint; a zero-length read is
        // accepted as the status-stage equivalent
        let mut ack = [0u8; 1];
        match self.bulk_read(&mut ack, COMMAND_TIMEOUT) {
            Ok(_) => Ok(response),
            Err(err) => {
                if let Ok(status) = self.cmd_status() {
                    if let Some(code) = status.status() {
                        if code != PicobootStatus::Ok {
                            return Err(Error::CommandFailed { status: code });
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Exits XIP so flash accepts erases and writes.
    pub fn exit_xip(&mut self) -> Result<()> {
        self.cmd(PicobootCmd::exit_xip(), &[]).map(|_| ())
    }

    /// Erases `[addr, addr + size)`; both must be sector-aligned.
    pub fn flash_erase(&mut self, addr: u32, size: u32) -> Result<()> {
        log::debug!("flash erase {addr:#010x}+{size:#x}");
        self.cmd(PicobootCmd::flash_erase(addr, size), &[])
            .map(|_| ())
    }

    /// Writes into RAM or previously erased flash, splitting the payload
    /// into command-sized chunks.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        for (chunk_addr, span) in write_chunks(addr, data.len()) {
            let chunk = &data[span];
            log::debug!("write {chunk_addr:#010x} ({} bytes)", chunk.len());
            self.cmd(PicobootCmd::write(chunk_addr, chunk.len() as u32), chunk)?;
        }
        Ok(())
    }

    /// Transfers control to `addr`. The device drops off the bus as a side
    /// effect, so "device gone" and a REBOOTING/OK status both count as
    /// success.
    pub fn exec(&mut self, addr: u32) -> Result<()> {
        log::debug!("exec {addr:#010x}");
        match self.cmd(PicobootCmd::exec(addr), &[]) {
            Ok(_) => Ok(()),
            Err(err) if err.is_device_gone() => Ok(()),
            Err(Error::CommandFailed {
                status: PicobootStatus::Rebooting,
            }) => Ok(()),
            Err(err) => match self.cmd_status() {
                Ok(status)
                    if matches!(
                        status.status(),
                        Some(PicobootStatus::Ok | PicobootStatus::Rebooting)
                    ) =>
                {
                    Ok(())
                }
                Err(poll_err) if poll_err.is_device_gone() => Ok(()),
                _ => Err(err),
            },
        }
    }

    /// Asks an RP2040 bootrom to reboot into flash.
    pub fn reboot(&mut self, pc: u32, sp: u32, delay_ms: u32) -> Result<()> {
        self.cmd(PicobootCmd::reboot(pc, sp, delay_ms), &[]).map(|_| ())
    }

    /// Asks an RP2350 bootrom to reboot normally.
    pub fn reboot2_normal(&mut self, delay_ms: u32) -> Result<()> {
        self.cmd(PicobootCmd::reboot2_normal(delay_ms), &[])
            .map(|_| ())
    }

    /// Clears endpoint halts and sends `IF_RESET` to drop any half-finished
    /// exchange a previous run left behind.
    pub fn reset_interface(&mut self) -> Result<()> {
        self.handle.clear_halt(self.ep_in).map_err(Error::usb_io)?;
        self.handle.clear_halt(self.ep_out).map_err(Error::usb_io)?;
        self.handle
            .write_control(
                rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface),
                PICOBOOT_IF_RESET,
                0,
                self.iface.into(),
                &[],
                COMMAND_TIMEOUT,
            )
            .map_err(Error::usb_io)?;
        Ok(())
    }

    /// Fetches the status frame for the most recent command.
    pub fn cmd_status(&mut self) -> Result<CmdStatus> {
        let mut buf = [0u8; STATUS_FRAME_SIZE];
        self.handle
            .read_control(
                rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Interface),
                PICOBOOT_IF_CMD_STATUS,
                0,
                self.iface.into(),
                &mut buf,
                COMMAND_TIMEOUT,
            )
            .map_err(Error::usb_io)?;
        CmdStatus::decode(&buf)
    }
}

/// A claimed stdio reset interface, released on drop.
#[derive(Debug)]
pub struct ResetConnection<T: UsbContext> {
    handle: DeviceHandle<T>,
    iface: u8,
}

impl<T: UsbContext> Drop for ResetConnection<T> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.iface);
    }
}

impl<T: UsbContext> ResetConnection<T> {
    /// Sends one of the `RESET_REQUEST_*` vendor requests.
    pub fn send_reset_request(&mut self, request: u8) -> Result<()> {
        self.handle
            .write_control(
                rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface),
                request,
                0,
                self.iface.into(),
                &[],
                COMMAND_TIMEOUT,
            )
            .map_err(Error::usb_io)?;
        Ok(())
    }
}

fn write_chunks(addr: u32, len: usize) -> impl Iterator<Item = (u32, std::ops::Range<usize>)> {
    (0..len).step_by(MAX_WRITE_CHUNK).map(move |offset| {
        let end = (offset + MAX_WRITE_CHUNK).min(len);
        (addr + offset as u32, offset..end)
    })
}
