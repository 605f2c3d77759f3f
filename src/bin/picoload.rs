use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use rusb::UsbContext as _;

use picoload::loader::{execute_plan, plan_image, print_dry_run};
use picoload::plan::{LoadPlan, LoadPolicy};
use picoload::usb::{find_device, DeviceSelector};
use picoload::{ElfImage, Error, MemoryMap, TargetID};

/// Load a 32-bit ELF image onto a Raspberry Pi microcontroller in BOOTSEL
/// mode.
#[derive(Parser, Debug)]
#[command(name = "picoload", version, about)]
struct Args {
    /// Allow erasing and writing flash segments (default: mirror them into
    /// SRAM when they fit, skip them otherwise)
    #[arg(long)]
    flash: bool,

    /// Do not execute the image after loading
    #[arg(long)]
    no_exec: bool,

    /// Print the operations that would run, without touching any device
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// ELF file to load
    elf: PathBuf,
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
    let policy = LoadPolicy {
        allow_flash: args.flash,
        exec_after: !args.no_exec,
    };
    let file = fs::File::open(&args.elf)
        .with_context(|| format!("failed to open {}", args.elf.display()))?;
    let elf = ElfImage::read(file)?;

    if args.dry_run {
        // no device to ask, so assume the smaller RP2040 layout
        let map = MemoryMap::for_target(TargetID::Rp2040);
        println!(
            "Dry run: assuming RP2040 memory layout (flash end {:#010x}, SRAM end {:#010x}).",
            map.flash_end, map.sram_end
        );
        let plan = plan_with_hint(&elf, &map, policy)?;
        report_plan_flags(&plan);
        print_dry_run(&plan);
        println!("Dry run complete.");
        return Ok(());
    }

    let mut ctx = rusb::Context::new().context("failed to initialize libusb")?;
    if args.verbose {
        ctx.set_log_level(rusb::LogLevel::Info);
    }
    let device = find_device(&ctx, DeviceSelector::BootselOnly)?;
    let map = MemoryMap::for_target(device.target());
    let plan = plan_with_hint(&elf, &map, policy)?;
    report_plan_flags(&plan);

    let mut conn = device.open_picoboot()?;
    if let Err(err) = conn.reset_interface() {
        log::warn!("reset interface failed: {err}");
    }
    execute_plan(&mut conn, &plan)?;
    println!("Load complete.");
    Ok(())
}

fn plan_with_hint(
    elf: &ElfImage,
    map: &MemoryMap,
    policy: LoadPolicy,
) -> anyhow::Result<LoadPlan> {
    plan_image(elf, map, policy).map_err(|err| match err {
        Error::EmptyPlan => anyhow::anyhow!(
            "no loadable RAM segments found (use --flash to enable flash writes)"
        ),
        other => other.into(),
    })
}

fn report_plan_flags(plan: &LoadPlan) {
    if plan.mirrored {
        println!("Mirroring flash segments into SRAM (use --flash to write flash instead).");
    }
    if plan.skipped {
        println!(
            "Skipping flash segments that do not fit in SRAM (use --flash to enable flash writes)."
        );
    }
}
