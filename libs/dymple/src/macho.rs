//! Mach-O structures and constants for the consumed subset: 64-bit
//! segments and sections, symbol table info, compressed dynamic linker
//! info, dylib loads, and the entry-point command.

use anillo_std::{Kind, Result};

pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

pub const LC_SYMTAB: u32 = 0x2;
pub const LC_LOAD_DYLIB: u32 = 0xC;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_DYLD_INFO: u32 = 0x22;
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
pub const LC_MAIN: u32 = 0x8000_0028;

pub const MACH_HEADER_64_LEN: usize = 32;
pub const SEGMENT_COMMAND_64_LEN: usize = 72;
pub const SECTION_64_LEN: usize = 80;
pub const DYLD_INFO_COMMAND_LEN: usize = 48;
pub const DYLIB_COMMAND_LEN: usize = 24;
pub const ENTRY_POINT_COMMAND_LEN: usize = 24;
pub const SYMTAB_COMMAND_LEN: usize = 24;

// Rebase bytecode: high nibble opcode, low nibble immediate.
pub const REBASE_OPCODE_MASK: u8 = 0xF0;
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

// Bind bytecode.
pub const BIND_OPCODE_MASK: u8 = 0xF0;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
pub const BIND_OPCODE_THREADED: u8 = 0xD0;

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

// Export trie terminal flags.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

pub fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(Kind::InvalidArgument)?;
    Ok(u32::from_le_bytes(slice.try_into().expect("4-byte slice")))
}

pub fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let slice = bytes
        .get(offset..offset + 8)
        .ok_or(Kind::InvalidArgument)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

/// Fixed-width segment/section name: NUL-padded 16 bytes.
pub fn read_name16(bytes: &[u8], offset: usize) -> Result<String> {
    let slice = bytes
        .get(offset..offset + 16)
        .ok_or(Kind::InvalidArgument)?;
    let len = slice.iter().position(|&b| b == 0).unwrap_or(16);
    Ok(String::from_utf8_lossy(&slice[..len]).into_owned())
}

/// Parsed `mach_header_64`.
#[derive(Debug, Clone, Copy)]
pub struct MachHeader {
    pub cputype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
}

impl MachHeader {
    pub fn parse(bytes: &[u8]) -> Result<MachHeader> {
        if read_u32(bytes, 0)? != MH_MAGIC_64 {
            return Err(Kind::InvalidArgument);
        }
        Ok(MachHeader {
            cputype: read_u32(bytes, 4)?,
            filetype: read_u32(bytes, 12)?,
            ncmds: read_u32(bytes, 16)?,
            sizeofcmds: read_u32(bytes, 20)?,
            flags: read_u32(bytes, 24)?,
        })
    }
}

/// One `LC_SEGMENT_64` with its sections.
#[derive(Debug, Clone)]
pub struct SegmentCommand {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub sections: Vec<SectionCommand>,
}

/// One `section_64`.
#[derive(Debug, Clone)]
pub struct SectionCommand {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
}

/// Byte ranges from `LC_DYLD_INFO(_ONLY)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DyldInfoCommand {
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

/// Symbol table offsets from `LC_SYMTAB`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

/// Everything the loader consumes from the load commands.
#[derive(Debug, Clone, Default)]
pub struct LoadCommands {
    pub segments: Vec<SegmentCommand>,
    pub dyld_info: Option<DyldInfoCommand>,
    pub symtab: Option<SymtabCommand>,
    pub dylibs: Vec<String>,
    pub entry_offset: Option<u64>,
}

/// Scan the load-command region following the header.
pub fn parse_load_commands(header: &MachHeader, commands: &[u8]) -> Result<LoadCommands> {
    let mut out = LoadCommands::default();
    let mut at = 0usize;
    for _ in 0..header.ncmds {
        let cmd = read_u32(commands, at)?;
        let cmdsize = read_u32(commands, at + 4)? as usize;
        if cmdsize < 8 || at + cmdsize > commands.len() {
            return Err(Kind::InvalidArgument);
        }
        let body = &commands[at..at + cmdsize];
        match cmd {
            LC_SEGMENT_64 => {
                if cmdsize < SEGMENT_COMMAND_64_LEN {
                    return Err(Kind::InvalidArgument);
                }
                let nsects = read_u32(body, 64)? as usize;
                if cmdsize < SEGMENT_COMMAND_64_LEN + nsects * SECTION_64_LEN {
                    return Err(Kind::InvalidArgument);
                }
                let segment_name = read_name16(body, 8)?;
                let mut sections = Vec::with_capacity(nsects);
                for s in 0..nsects {
                    let base = SEGMENT_COMMAND_64_LEN + s * SECTION_64_LEN;
                    sections.push(SectionCommand {
                        name: read_name16(body, base)?,
                        segment_name: read_name16(body, base + 16)?,
                        addr: read_u64(body, base + 32)?,
                        size: read_u64(body, base + 40)?,
                        offset: read_u32(body, base + 48)?,
                    });
                }
                out.segments.push(SegmentCommand {
                    name: segment_name,
                    vmaddr: read_u64(body, 24)?,
                    vmsize: read_u64(body, 32)?,
                    fileoff: read_u64(body, 40)?,
                    filesize: read_u64(body, 48)?,
                    maxprot: read_u32(body, 56)?,
                    initprot: read_u32(body, 60)?,
                    sections,
                });
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                if cmdsize < DYLD_INFO_COMMAND_LEN {
                    return Err(Kind::InvalidArgument);
                }
                out.dyld_info = Some(DyldInfoCommand {
                    rebase_off: read_u32(body, 8)?,
                    rebase_size: read_u32(body, 12)?,
                    bind_off: read_u32(body, 16)?,
                    bind_size: read_u32(body, 20)?,
                    weak_bind_off: read_u32(body, 24)?,
                    weak_bind_size: read_u32(body, 28)?,
                    lazy_bind_off: read_u32(body, 32)?,
                    lazy_bind_size: read_u32(body, 36)?,
                    export_off: read_u32(body, 40)?,
                    export_size: read_u32(body, 44)?,
                });
            }
            LC_SYMTAB => {
                if cmdsize < SYMTAB_COMMAND_LEN {
                    return Err(Kind::InvalidArgument);
                }
                out.symtab = Some(SymtabCommand {
                    symoff: read_u32(body, 8)?,
                    nsyms: read_u32(body, 12)?,
                    stroff: read_u32(body, 16)?,
                    strsize: read_u32(body, 20)?,
                });
            }
            LC_LOAD_DYLIB => {
                if cmdsize < DYLIB_COMMAND_LEN {
                    return Err(Kind::InvalidArgument);
                }
                let name_offset = read_u32(body, 8)? as usize;
                let name_bytes = body.get(name_offset..).ok_or(Kind::InvalidArgument)?;
                let len = name_bytes
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(name_bytes.len());
                out.dylibs
                    .push(String::from_utf8_lossy(&name_bytes[..len]).into_owned());
            }
            LC_MAIN => {
                if cmdsize < ENTRY_POINT_COMMAND_LEN {
                    return Err(Kind::InvalidArgument);
                }
                out.entry_offset = Some(read_u64(body, 8)?);
            }
            _ => {}
        }
        at += cmdsize;
    }
    Ok(out)
}
