//! Reader for 32-bit little-endian ELF executables.
//!
//! Only the pieces PICOBOOT loading needs: the file header's entry point and
//! program-header table, and the file bytes backing each `PT_LOAD` segment.
//! No relocation, symbol or section handling. Every multi-byte field is
//! decoded byte-by-byte as little-endian; nothing is reinterpreted from an
//! in-memory layout.

use std::io::Read;

use crate::error::{Error, Result};

/// Program header type of a loadable segment.
pub const PT_LOAD: u32 = 1;

const ELF_HEADER_SIZE: usize = 52;
const IDENT_SIZE: u32 = 16;
const PH_ENTRY_DECODED_SIZE: usize = 32;
const ELF_CLASS_32: u8 = 1;
const ELF_DATA_LSB: u8 = 1;

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = data
        .get(offset..offset + 2)
        .ok_or(Error::ElfFormat("ELF file too small"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or(Error::ElfFormat("ELF file too small"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The ELF32 file header fields this loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
}

/// One entry of the ELF32 program-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub ty: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ProgramHeader {
    /// True for a `PT_LOAD` segment that actually carries file bytes.
    pub fn is_load(&self) -> bool {
        self.ty == PT_LOAD && self.filesz > 0
    }

    /// The address the segment is loaded at: `paddr` when non-zero, else
    /// `vaddr`. Zero means the segment is invalid for loading.
    pub fn load_address(&self) -> u32 {
        if self.paddr != 0 {
            self.paddr
        } else {
            self.vaddr
        }
    }
}

/// An immutable, fully-read ELF image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    data: Vec<u8>,
    header: ElfHeader,
    segments: Vec<ProgramHeader>,
}

impl ElfImage {
    /// Reads the whole stream into memory and parses it.
    pub fn read(mut source: impl Read) -> Result<Self> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        Self::parse(data)
    }

    /// Parses an in-memory ELF image, validating every invariant the loader
    /// relies on.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::ElfEmpty);
        }
        if data.len() < ELF_HEADER_SIZE {
            return Err(Error::ElfFormat("ELF header truncated"));
        }
        if data[0] != 0x7f || data[1] != b'E' || data[2] != b'L' || data[3] != b'F' {
            return Err(Error::ElfFormat("missing ELF magic"));
        }
        if data[4] != ELF_CLASS_32 {
            return Err(Error::ElfFormat("unsupported ELF class"));
        }
        if data[5] != ELF_DATA_LSB {
            return Err(Error::ElfFormat("unsupported ELF endianness"));
        }

        let header = ElfHeader {
            entry: read_u32(&data, 24)?,
            phoff: read_u32(&data, 28)?,
            phentsize: read_u16(&data, 42)?,
            phnum: read_u16(&data, 44)?,
        };

        if header.phoff < IDENT_SIZE || header.phentsize == 0 {
            return Err(Error::ElfFormat("ELF program header table missing"));
        }
        let table_end =
            u64::from(header.phoff) + u64::from(header.phentsize) * u64::from(header.phnum);
        if table_end > data.len() as u64 {
            return Err(Error::ElfFormat("ELF program header table truncated"));
        }

        let mut segments = Vec::with_capacity(header.phnum as usize);
        for i in 0..header.phnum {
            let base = header.phoff as usize + header.phentsize as usize * i as usize;
            if base + PH_ENTRY_DECODED_SIZE > data.len() {
                return Err(Error::ElfFormat("ELF program header truncated"));
            }
            segments.push(ProgramHeader {
                ty: read_u32(&data, base)?,
                offset: read_u32(&data, base + 4)?,
                vaddr: read_u32(&data, base + 8)?,
                paddr: read_u32(&data, base + 12)?,
                filesz: read_u32(&data, base + 16)?,
                memsz: read_u32(&data, base + 20)?,
                flags: read_u32(&data, base + 24)?,
                align: read_u32(&data, base + 28)?,
            });
        }

        Ok(ElfImage {
            data,
            header,
            segments,
        })
    }

    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    pub fn segments(&self) -> &[ProgramHeader] {
        &self.segments
    }

    /// The file bytes backing a segment: exactly
    /// `[offset, offset + filesz)`. Empty for `filesz == 0`.
    pub fn content(&self, segment: &ProgramHeader) -> Result<&[u8]> {
        if segment.filesz == 0 {
            return Ok(&[]);
        }
        let end = u64::from(segment.offset) + u64::from(segment.filesz);
        if end > self.data.len() as u64 {
            return Err(Error::ElfFormat("ELF segment out of range"));
        }
        Ok(&self.data[segment.offset as usize..end as usize])
    }
}
