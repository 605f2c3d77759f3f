use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use rusb::UsbContext as _;

use picoload::reboot::{reboot_device, RebootOutcome, RebootTarget};
use picoload::usb::{find_device, DeviceSelector};

/// Reboot a Raspberry Pi microcontroller, optionally into BOOTSEL mode.
#[derive(Parser, Debug)]
#[command(name = "picoreboot", version, about)]
struct Args {
    /// Reboot into BOOTSEL mode instead of the flash-resident firmware
    #[arg(short = 'u', long)]
    bootsel: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(args: &Args) -> anyhow::Result<()> {
    let target = if args.bootsel {
        RebootTarget::Bootsel
    } else {
        RebootTarget::Normal
    };

    let mut ctx = rusb::Context::new().context("failed to initialize libusb")?;
    if args.verbose {
        ctx.set_log_level(rusb::LogLevel::Info);
    }
    let device = find_device(&ctx, DeviceSelector::BootselOrStdio)?;
    match reboot_device(&device, target)? {
        RebootOutcome::AlreadyInBootsel => println!("Device is already in BOOTSEL mode."),
        RebootOutcome::Requested if args.bootsel => {
            println!("Requested reboot into BOOTSEL mode.")
        }
        RebootOutcome::Requested => println!("Reboot request sent."),
    }
    Ok(())
}
