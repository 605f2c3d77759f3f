//! End-to-end load runs: ELF bytes in, PICOBOOT operations out.

use rusb::UsbContext;

use crate::elf::ElfImage;
use crate::error::Result;
use crate::memmap::MemoryMap;
use crate::plan::{LoadPlan, LoadPolicy, PlanOp, Planner};
use crate::usb::PicobootConnection;

/// Parses an ELF image and plans its load under `policy`.
pub fn plan_from_elf(bytes: Vec<u8>, map: &MemoryMap, policy: LoadPolicy) -> Result<LoadPlan> {
    let elf = ElfImage::parse(bytes)?;
    plan_image(&elf, map, policy)
}

/// Plans the load of an already-parsed image.
pub fn plan_image(elf: &ElfImage, map: &MemoryMap, policy: LoadPolicy) -> Result<LoadPlan> {
    let mut planner = Planner::new(*map, policy);
    for segment in elf.segments() {
        if !segment.is_load() {
            continue;
        }
        let data = elf.content(segment)?.to_vec();
        planner.add_segment(segment, data)?;
    }
    planner.finish(elf.header().entry)
}

/// Executes a plan against a claimed connection, stopping at the first
/// failure.
pub fn execute_plan<T: UsbContext>(
    conn: &mut PicobootConnection<T>,
    plan: &LoadPlan,
) -> Result<()> {
    for op in &plan.ops {
        match op {
            PlanOp::ExitXip => conn.exit_xip()?,
            PlanOp::FlashErase { start, end } => conn.flash_erase(*start, end - start)?,
            PlanOp::RamWrite { addr, data } => conn.write(*addr, data)?,
            PlanOp::FlashWrite { page_base, data } => conn.write(*page_base, data)?,
            PlanOp::Exec { addr } => conn.exec(*addr)?,
        }
    }
    Ok(())
}

/// Prints the would-do trace for a plan without any USB traffic.
pub fn print_dry_run(plan: &LoadPlan) {
    for op in &plan.ops {
        match op {
            PlanOp::ExitXip => println!("Dry run: would exit XIP mode."),
            PlanOp::FlashErase { start, end } => println!(
                "Dry run: would erase flash {:#010x}-{:#010x} ({} bytes).",
                start,
                end,
                end - start
            ),
            PlanOp::RamWrite { addr, data } => println!(
                "Dry run: would write RAM {:#010x} ({} bytes).",
                addr,
                data.len()
            ),
            PlanOp::FlashWrite { page_base, data } => println!(
                "Dry run: would write flash page {:#010x} ({} bytes).",
                page_base,
                data.len()
            ),
            PlanOp::Exec { addr } => println!("Dry run: would execute at {addr:#010x}."),
        }
    }
}
