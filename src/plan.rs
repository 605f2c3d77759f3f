//! Turns loadable ELF segments into an ordered plan of PICOBOOT operations.
//!
//! Planning is pure: it consumes segments and a [`MemoryMap`] and produces a
//! [`LoadPlan`] without touching the device. The plan's operation order is
//! fixed: XIP exit first, then all flash erases, then RAM writes in segment
//! order, then flash pages in ascending address order, then the optional
//! execute.

use std::collections::BTreeMap;

use crate::elf::ProgramHeader;
use crate::error::{Error, Result};
use crate::memmap::MemoryMap;
use crate::{PAGE_SIZE, SECTOR_SIZE};

/// Largest payload carried by a single WRITE command.
pub const MAX_WRITE_CHUNK: usize = 1024;

/// What the caller allows the loader to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPolicy {
    /// Permit erasing and writing external flash. When false, flash
    /// segments are mirrored into SRAM where they fit and skipped where
    /// they do not.
    pub allow_flash: bool,
    /// Transfer control to the loaded image once everything is written.
    pub exec_after: bool,
}

/// One step of a load run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    /// Leave execute-in-place mode so flash can be erased and written.
    ExitXip,
    /// Erase `[start, end)`; both bounds are sector-aligned.
    FlashErase { start: u32, end: u32 },
    /// Write bytes into SRAM (or any non-flash destination).
    RamWrite { addr: u32, data: Vec<u8> },
    /// Write one zero-padded 256-byte flash page.
    FlashWrite { page_base: u32, data: Vec<u8> },
    /// Start execution at `addr`.
    Exec { addr: u32 },
}

/// The ordered operation list plus the policy outcomes user-facing code
/// reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub ops: Vec<PlanOp>,
    /// At least one flash segment was diverted to its SRAM mirror.
    pub mirrored: bool,
    /// At least one flash segment was dropped because it does not fit in
    /// SRAM.
    pub skipped: bool,
}

fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Sorts ranges by start and fuses every overlapping or adjacent pair,
/// yielding a disjoint ascending list.
fn merge_ranges(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    if ranges.is_empty() {
        return ranges;
    }
    ranges.sort_by_key(|range| range.0);
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    merged.push(ranges[0]);
    for &(start, end) in &ranges[1..] {
        let last = merged.last_mut().unwrap();
        if start <= last.1 {
            last.1 = last.1.max(end);
        } else {
            merged.push((start, end));
        }
    }
    merged
}

/// Accumulates segments and assembles the final [`LoadPlan`].
#[derive(Debug)]
pub struct Planner {
    map: MemoryMap,
    policy: LoadPolicy,
    ram_writes: Vec<(u32, Vec<u8>)>,
    flash_pages: BTreeMap<u32, Vec<u8>>,
    erase_ranges: Vec<(u32, u32)>,
    mirrored: bool,
    skipped: bool,
}

impl Planner {
    pub fn new(map: MemoryMap, policy: LoadPolicy) -> Self {
        Planner {
            map,
            policy,
            ram_writes: Vec::new(),
            flash_pages: BTreeMap::new(),
            erase_ranges: Vec::new(),
            mirrored: false,
            skipped: false,
        }
    }

    /// Files one segment into the plan. Non-loadable and empty segments are
    /// skipped silently; a loadable segment without a load address is a
    /// format error.
    pub fn add_segment(&mut self, segment: &ProgramHeader, data: Vec<u8>) -> Result<()> {
        if !segment.is_load() || data.is_empty() {
            return Ok(());
        }
        let addr = segment.load_address();
        if addr == 0 {
            return Err(Error::InvalidSegmentAddress);
        }

        if self.map.is_flash(addr) {
            if !self.policy.allow_flash {
                match self.map.map_flash_to_sram(addr, data.len() as u32) {
                    Some(mapped) => {
                        self.mirrored = true;
                        self.ram_writes.push((mapped, data));
                    }
                    None => self.skipped = true,
                }
                return Ok(());
            }
            let end = addr + data.len() as u32;
            self.erase_ranges
                .push((align_down(addr, SECTOR_SIZE), align_up(end, SECTOR_SIZE)));
            self.distribute_pages(addr, &data);
        } else {
            self.ram_writes.push((addr, data));
        }
        Ok(())
    }

    /// Spreads segment bytes over zero-initialized 256-byte pages. Bytes a
    /// segment does not cover stay zero; pages are never read back from
    /// live flash.
    fn distribute_pages(&mut self, addr: u32, data: &[u8]) {
        let mut consumed = 0usize;
        while consumed < data.len() {
            let byte_addr = addr + consumed as u32;
            let page_base = align_down(byte_addr, PAGE_SIZE);
            let page_offset = (byte_addr - page_base) as usize;
            let take = (PAGE_SIZE as usize - page_offset).min(data.len() - consumed);
            let page = self
                .flash_pages
                .entry(page_base)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
            page[page_offset..page_offset + take]
                .copy_from_slice(&data[consumed..consumed + take]);
            consumed += take;
        }
    }

    /// Assembles the ordered plan, applying the entry-point rules when
    /// execution is requested.
    pub fn finish(self, entry: u32) -> Result<LoadPlan> {
        if !self.policy.allow_flash && self.flash_pages.is_empty() && self.ram_writes.is_empty() {
            return Err(Error::EmptyPlan);
        }

        let mut ops = Vec::new();
        if !self.flash_pages.is_empty() {
            ops.push(PlanOp::ExitXip);
            for (start, end) in merge_ranges(self.erase_ranges) {
                ops.push(PlanOp::FlashErase { start, end });
            }
        }
        for (addr, data) in self.ram_writes {
            ops.push(PlanOp::RamWrite { addr, data });
        }
        for (page_base, data) in self.flash_pages {
            ops.push(PlanOp::FlashWrite { page_base, data });
        }

        if self.policy.exec_after {
            if entry == 0 {
                return Err(Error::EntryInvalid);
            }
            let mut exec_addr = entry;
            if !self.policy.allow_flash && self.map.is_flash(entry) {
                exec_addr = self
                    .map
                    .map_flash_to_sram(entry, 4)
                    .ok_or(Error::EntryUnmappable(entry))?;
            } else if !self.policy.allow_flash
                && !self.map.is_sram(entry)
                && !self.map.is_flash(entry)
            {
                return Err(Error::EntryOutOfRange(entry));
            }
            ops.push(PlanOp::Exec { addr: exec_addr });
        }

        Ok(LoadPlan {
            ops,
            mirrored: self.mirrored,
            skipped: self.skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::PT_LOAD;
    use crate::memmap::TargetID;
    use crate::{FLASH_START, SRAM_START};

    fn load_segment(addr: u32, filesz: u32) -> ProgramHeader {
        ProgramHeader {
            ty: PT_LOAD,
            offset: 0,
            vaddr: addr,
            paddr: 0,
            filesz,
            memsz: filesz,
            flags: 0,
            align: 4,
        }
    }

    fn plan_one(
        target: TargetID,
        addr: u32,
        data: Vec<u8>,
        policy: LoadPolicy,
        entry: u32,
    ) -> Result<LoadPlan> {
        let mut planner = Planner::new(MemoryMap::for_target(target), policy);
        planner.add_segment(&load_segment(addr, data.len() as u32), data)?;
        planner.finish(entry)
    }

    #[test]
    fn sram_segment_becomes_single_ram_write_then_exec() {
        let data = vec![0x5A; 512];
        let plan = plan_one(
            TargetID::Rp2040,
            0x2000_0100,
            data.clone(),
            LoadPolicy {
                allow_flash: false,
                exec_after: true,
            },
            0x2000_0100,
        )
        .unwrap();

        assert_eq!(
            plan.ops,
            vec![
                PlanOp::RamWrite {
                    addr: 0x2000_0100,
                    data
                },
                PlanOp::Exec { addr: 0x2000_0100 },
            ]
        );
        assert!(!plan.mirrored);
        assert!(!plan.skipped);
    }

    #[test]
    fn flash_segment_mirrors_into_sram_without_flash_policy() {
        let data = vec![0xC3; 1024];
        let plan = plan_one(
            TargetID::Rp2040,
            FLASH_START,
            data.clone(),
            LoadPolicy {
                allow_flash: false,
                exec_after: true,
            },
            FLASH_START,
        )
        .unwrap();

        assert_eq!(
            plan.ops,
            vec![
                PlanOp::RamWrite {
                    addr: SRAM_START,
                    data
                },
                PlanOp::Exec { addr: SRAM_START },
            ]
        );
        assert!(plan.mirrored);
        assert!(!plan.skipped);
    }

    #[test]
    fn flash_segments_plan_erases_and_pages() {
        let policy = LoadPolicy {
            allow_flash: true,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2040), policy);
        planner
            .add_segment(&load_segment(0x1000_0000, 300), vec![0x11; 300])
            .unwrap();
        planner
            .add_segment(&load_segment(0x1000_0400, 100), vec![0x22; 100])
            .unwrap();
        let plan = planner.finish(0).unwrap();

        assert_eq!(plan.ops[0], PlanOp::ExitXip);
        assert_eq!(
            plan.ops[1],
            PlanOp::FlashErase {
                start: 0x1000_0000,
                end: 0x1000_1000
            }
        );

        let pages: Vec<(u32, &Vec<u8>)> = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::FlashWrite { page_base, data } => Some((*page_base, data)),
                _ => None,
            })
            .collect();
        assert_eq!(
            pages.iter().map(|(base, _)| *base).collect::<Vec<_>>(),
            vec![0x1000_0000, 0x1000_0100, 0x1000_0400]
        );
        for (_, data) in &pages {
            assert_eq!(data.len(), 256);
        }
        // first page full of segment bytes, second only 300 - 256 = 44
        assert!(pages[0].1.iter().all(|&b| b == 0x11));
        assert!(pages[1].1[..44].iter().all(|&b| b == 0x11));
        assert!(pages[1].1[44..].iter().all(|&b| b == 0));
        assert!(pages[2].1[..100].iter().all(|&b| b == 0x22));
        assert!(pages[2].1[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn erase_ranges_cover_every_planned_page() {
        let policy = LoadPolicy {
            allow_flash: true,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2040), policy);
        planner
            .add_segment(&load_segment(0x1000_0F80, 0x200), vec![1; 0x200])
            .unwrap();
        planner
            .add_segment(&load_segment(0x1000_5000, 64), vec![2; 64])
            .unwrap();
        let plan = planner.finish(0).unwrap();

        let erases: Vec<(u32, u32)> = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::FlashErase { start, end } => Some((*start, *end)),
                _ => None,
            })
            .collect();
        for op in &plan.ops {
            if let PlanOp::FlashWrite { page_base, .. } = op {
                assert!(
                    erases
                        .iter()
                        .any(|&(start, end)| start <= *page_base && page_base + 256 <= end),
                    "page {page_base:#x} not covered by any erase"
                );
            }
        }
    }

    #[test]
    fn mid_page_segment_is_zero_padded_in_place() {
        let data: Vec<u8> = (1..=100u8).collect();
        let plan = plan_one(
            TargetID::Rp2040,
            0x1000_0010,
            data.clone(),
            LoadPolicy {
                allow_flash: true,
                exec_after: false,
            },
            0,
        )
        .unwrap();

        let page = plan
            .ops
            .iter()
            .find_map(|op| match op {
                PlanOp::FlashWrite { page_base, data } if *page_base == 0x1000_0000 => Some(data),
                _ => None,
            })
            .unwrap();
        assert!(page[..0x10].iter().all(|&b| b == 0));
        assert_eq!(&page[0x10..0x10 + 100], &data[..]);
        assert!(page[0x10 + 100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn adjacent_erase_ranges_coalesce() {
        assert_eq!(
            merge_ranges(vec![
                (0x1000_0000, 0x1000_1000),
                (0x1000_1000, 0x1000_2000)
            ]),
            vec![(0x1000_0000, 0x1000_2000)]
        );
    }

    #[test]
    fn merged_ranges_are_sorted_and_disjoint() {
        let merged = merge_ranges(vec![
            (0x1000_4000, 0x1000_6000),
            (0x1000_0000, 0x1000_2000),
            (0x1000_5000, 0x1000_7000),
            (0x1000_9000, 0x1000_A000),
        ]);
        assert_eq!(
            merged,
            vec![
                (0x1000_0000, 0x1000_2000),
                (0x1000_4000, 0x1000_7000),
                (0x1000_9000, 0x1000_A000),
            ]
        );
        for pair in merged.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn unmappable_flash_segment_is_skipped_and_plan_empties() {
        let result = plan_one(
            TargetID::Rp2350,
            0x13FF_FF00,
            vec![0; 512],
            LoadPolicy {
                allow_flash: false,
                exec_after: false,
            },
            0,
        );
        assert!(matches!(result, Err(Error::EmptyPlan)));

        // with another live segment the plan survives and reports the skip
        let policy = LoadPolicy {
            allow_flash: false,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2350), policy);
        planner
            .add_segment(&load_segment(0x13FF_FF00, 512), vec![0; 512])
            .unwrap();
        planner
            .add_segment(&load_segment(0x2000_0000, 16), vec![7; 16])
            .unwrap();
        let plan = planner.finish(0).unwrap();
        assert!(plan.skipped);
        assert_eq!(plan.ops.len(), 1);
    }

    #[test]
    fn planner_is_deterministic() {
        let build = || {
            let policy = LoadPolicy {
                allow_flash: true,
                exec_after: true,
            };
            let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2350), policy);
            planner
                .add_segment(&load_segment(0x1000_2000, 700), vec![3; 700])
                .unwrap();
            planner
                .add_segment(&load_segment(0x2000_1000, 48), vec![4; 48])
                .unwrap();
            planner.finish(0x1000_2000).unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn ram_writes_keep_segment_input_order() {
        let policy = LoadPolicy {
            allow_flash: false,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2040), policy);
        planner
            .add_segment(&load_segment(0x2000_2000, 8), vec![1; 8])
            .unwrap();
        planner
            .add_segment(&load_segment(0x2000_0000, 8), vec![2; 8])
            .unwrap();
        let plan = planner.finish(0).unwrap();
        let addrs: Vec<u32> = plan
            .ops
            .iter()
            .filter_map(|op| match op {
                PlanOp::RamWrite { addr, .. } => Some(*addr),
                _ => None,
            })
            .collect();
        assert_eq!(addrs, vec![0x2000_2000, 0x2000_0000]);
    }

    #[test]
    fn non_load_and_empty_segments_are_ignored() {
        let policy = LoadPolicy {
            allow_flash: false,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2040), policy);
        let mut note = load_segment(0x2000_0000, 4);
        note.ty = 4; // PT_NOTE
        planner.add_segment(&note, vec![9; 4]).unwrap();
        planner
            .add_segment(&load_segment(0x2000_0000, 0), Vec::new())
            .unwrap();
        assert!(matches!(planner.finish(0), Err(Error::EmptyPlan)));
    }

    #[test]
    fn loadable_segment_without_address_is_rejected() {
        let policy = LoadPolicy {
            allow_flash: false,
            exec_after: false,
        };
        let mut planner = Planner::new(MemoryMap::for_target(TargetID::Rp2040), policy);
        let err = planner
            .add_segment(&load_segment(0, 4), vec![0; 4])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSegmentAddress));
    }

    #[test]
    fn exec_entry_must_be_nonzero() {
        let result = plan_one(
            TargetID::Rp2040,
            0x2000_0000,
            vec![0; 4],
            LoadPolicy {
                allow_flash: false,
                exec_after: true,
            },
            0,
        );
        assert!(matches!(result, Err(Error::EntryInvalid)));
    }

    #[test]
    fn exec_entry_deep_in_flash_is_unmappable() {
        let result = plan_one(
            TargetID::Rp2350,
            0x2000_0000,
            vec![0; 4],
            LoadPolicy {
                allow_flash: false,
                exec_after: true,
            },
            0x13FF_FF00,
        );
        assert!(matches!(result, Err(Error::EntryUnmappable(0x13FF_FF00))));
    }

    #[test]
    fn exec_entry_outside_flash_and_sram_is_rejected() {
        let result = plan_one(
            TargetID::Rp2040,
            0x2000_0000,
            vec![0; 4],
            LoadPolicy {
                allow_flash: false,
                exec_after: true,
            },
            0x4000_0000,
        );
        assert!(matches!(result, Err(Error::EntryOutOfRange(0x4000_0000))));
    }

    #[test]
    fn exec_entry_kept_verbatim_when_flash_writes_allowed() {
        let plan = plan_one(
            TargetID::Rp2040,
            0x1000_0000,
            vec![0; 4],
            LoadPolicy {
                allow_flash: true,
                exec_after: true,
            },
            0x1000_0000,
        )
        .unwrap();
        assert_eq!(plan.ops.last(), Some(&PlanOp::Exec { addr: 0x1000_0000 }));
    }
}
