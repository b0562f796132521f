//! Mach-O image builder for linker tests.
//!
//! Emits the consumed subset: a 64-bit header, `LC_SEGMENT_64` commands
//! with sections, `LC_DYLD_INFO_ONLY`, `LC_LOAD_DYLIB`, and `LC_MAIN`,
//! with segment file data and the linker-info blobs laid out after the
//! load commands.

pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_LOAD_DYLIB: u32 = 0xC;
pub const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
pub const LC_MAIN: u32 = 0x8000_0028;

// Rebase / bind opcodes used by the program builders.
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_TYPE_POINTER: u8 = 1;

pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_THREADED: u8 = 0xD0;
pub const BIND_TYPE_POINTER: u8 = 1;

pub fn uleb(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn sleb(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// Two-byte padded ULEB, for deterministic trie layout.
fn uleb2(value: u64) -> [u8; 2] {
    assert!(value < 1 << 14);
    [(value as u8 & 0x7F) | 0x80, (value >> 7) as u8]
}

/// Flat export trie: a non-terminal root whose children are whole names.
/// Names must not be prefixes of one another.
pub fn export_trie(entries: &[(&str, u64)]) -> Vec<u8> {
    let mut root = vec![0u8, entries.len() as u8];
    let root_len: usize = 2 + entries.iter().map(|(n, _)| n.len() + 1 + 2).sum::<usize>();
    let mut nodes = Vec::new();
    let mut node_at = root_len;
    for (name, offset) in entries {
        root.extend_from_slice(name.as_bytes());
        root.push(0);
        root.extend_from_slice(&uleb2(node_at as u64));
        let mut node = vec![4u8];
        node.extend_from_slice(&uleb2(0));
        node.extend_from_slice(&uleb2(*offset));
        node.push(0);
        node_at += node.len();
        nodes.push(node);
    }
    root.extend(nodes.into_iter().flatten());
    root
}

/// Rebase program: pointer type, `count` consecutive slots starting at
/// `(segment, offset)`.
pub fn rebase_program(segment: u8, offset: u64, count: u8) -> Vec<u8> {
    assert!(count <= 0x0F);
    let mut p = vec![
        REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
        REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment,
    ];
    p.extend(uleb(offset));
    p.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | count);
    p.push(REBASE_OPCODE_DONE);
    p
}

/// Eager bind program: one pointer bind of `symbol` from dependency
/// `ordinal` into `(segment, offset)`, plus `addend`.
pub fn bind_program(segment: u8, offset: u64, ordinal: u8, symbol: &str, addend: i64) -> Vec<u8> {
    let mut p = vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal];
    p.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
    p.extend_from_slice(symbol.as_bytes());
    p.push(0);
    p.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
    if addend != 0 {
        p.push(BIND_OPCODE_SET_ADDEND_SLEB);
        p.extend(sleb(addend));
    }
    p.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment);
    p.extend(uleb(offset));
    p.push(BIND_OPCODE_DO_BIND);
    p.push(BIND_OPCODE_DONE);
    p
}

/// Lazy-bind run for one stub slot. Runs are concatenated; the stub passes
/// the run's byte offset within the region.
pub fn lazy_bind_run(segment: u8, offset: u64, ordinal: u8, symbol: &str) -> Vec<u8> {
    let mut p = vec![BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | segment];
    p.extend(uleb(offset));
    p.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
    p.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
    p.extend_from_slice(symbol.as_bytes());
    p.push(0);
    p.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
    p.push(BIND_OPCODE_DO_BIND);
    p.push(BIND_OPCODE_DONE);
    p
}

pub struct SectionSpec {
    pub name: &'static str,
    pub addr: u64,
    pub size: u64,
    /// Offset of the section's bytes inside the segment's file data.
    pub fileoff_rel: u64,
}

pub struct SegmentSpec {
    pub name: &'static str,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub maxprot: u32,
    pub data: Vec<u8>,
    pub sections: Vec<SectionSpec>,
}

#[derive(Default)]
pub struct MachBuilder {
    segments: Vec<SegmentSpec>,
    dylibs: Vec<String>,
    rebase: Vec<u8>,
    bind: Vec<u8>,
    lazy: Vec<u8>,
    export: Vec<u8>,
    entry_fileoff: Option<u64>,
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

impl MachBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(mut self, spec: SegmentSpec) -> Self {
        self.segments.push(spec);
        self
    }

    /// Convenience: one writable data segment at link address `vmaddr`.
    pub fn data_segment(self, vmaddr: u64, vmsize: u64, data: Vec<u8>) -> Self {
        self.segment(SegmentSpec {
            name: "__DATA",
            vmaddr,
            vmsize,
            maxprot: 3,
            data,
            sections: Vec::new(),
        })
    }

    pub fn load_dylib(mut self, path: &str) -> Self {
        self.dylibs.push(path.to_string());
        self
    }

    pub fn rebase_info(mut self, bytes: Vec<u8>) -> Self {
        self.rebase = bytes;
        self
    }

    pub fn bind_info(mut self, bytes: Vec<u8>) -> Self {
        self.bind = bytes;
        self
    }

    pub fn lazy_bind_info(mut self, bytes: Vec<u8>) -> Self {
        self.lazy = bytes;
        self
    }

    pub fn exports(mut self, entries: &[(&str, u64)]) -> Self {
        self.export = export_trie(entries);
        self
    }

    pub fn entry_at_file_offset(mut self, fileoff: u64) -> Self {
        self.entry_fileoff = Some(fileoff);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut command_sizes = Vec::new();
        for segment in &self.segments {
            command_sizes.push(72 + 80 * segment.sections.len());
        }
        let mut ncmds = self.segments.len() + 1; // + dyld info
        let mut dylib_sizes = Vec::new();
        for dylib in &self.dylibs {
            let len = 24 + dylib.len() + 1;
            dylib_sizes.push((len + 7) & !7);
            ncmds += 1;
        }
        if self.entry_fileoff.is_some() {
            ncmds += 1;
        }
        let sizeofcmds: usize = command_sizes.iter().sum::<usize>()
            + 48
            + dylib_sizes.iter().sum::<usize>()
            + if self.entry_fileoff.is_some() { 24 } else { 0 };

        // File layout: header, commands, segment data, linker-info blobs.
        let mut cursor = 32 + sizeofcmds;
        let mut segment_offsets = Vec::new();
        for segment in &self.segments {
            segment_offsets.push(cursor as u64);
            cursor += segment.data.len();
        }
        let rebase_off = cursor;
        cursor += self.rebase.len();
        let bind_off = cursor;
        cursor += self.bind.len();
        let lazy_off = cursor;
        cursor += self.lazy.len();
        let export_off = cursor;

        let mut out = Vec::new();
        push_u32(&mut out, MH_MAGIC_64);
        push_u32(&mut out, 0x0100_000C); // cputype: arm64
        push_u32(&mut out, 0);
        push_u32(&mut out, 6); // MH_DYLIB
        push_u32(&mut out, ncmds as u32);
        push_u32(&mut out, sizeofcmds as u32);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0);

        for (i, segment) in self.segments.iter().enumerate() {
            push_u32(&mut out, LC_SEGMENT_64);
            push_u32(&mut out, command_sizes[i] as u32);
            out.extend_from_slice(&name16(segment.name));
            push_u64(&mut out, segment.vmaddr);
            push_u64(&mut out, segment.vmsize);
            push_u64(&mut out, segment_offsets[i]);
            push_u64(&mut out, segment.data.len() as u64);
            push_u32(&mut out, segment.maxprot);
            push_u32(&mut out, segment.maxprot);
            push_u32(&mut out, segment.sections.len() as u32);
            push_u32(&mut out, 0);
            for section in &segment.sections {
                out.extend_from_slice(&name16(section.name));
                out.extend_from_slice(&name16(segment.name));
                push_u64(&mut out, section.addr);
                push_u64(&mut out, section.size);
                push_u32(&mut out, (segment_offsets[i] + section.fileoff_rel) as u32);
                push_u32(&mut out, 3); // align
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
                push_u32(&mut out, 0);
            }
        }

        push_u32(&mut out, LC_DYLD_INFO_ONLY);
        push_u32(&mut out, 48);
        push_u32(&mut out, rebase_off as u32);
        push_u32(&mut out, self.rebase.len() as u32);
        push_u32(&mut out, bind_off as u32);
        push_u32(&mut out, self.bind.len() as u32);
        push_u32(&mut out, 0); // weak bind
        push_u32(&mut out, 0);
        push_u32(&mut out, lazy_off as u32);
        push_u32(&mut out, self.lazy.len() as u32);
        push_u32(&mut out, export_off as u32);
        push_u32(&mut out, self.export.len() as u32);

        for (i, dylib) in self.dylibs.iter().enumerate() {
            push_u32(&mut out, LC_LOAD_DYLIB);
            push_u32(&mut out, dylib_sizes[i] as u32);
            push_u32(&mut out, 24); // name offset
            push_u32(&mut out, 0); // timestamp
            push_u32(&mut out, 0x1_0000); // current version
            push_u32(&mut out, 0x1_0000); // compatibility version
            out.extend_from_slice(dylib.as_bytes());
            out.push(0);
            while out.len() % 8 != 0 {
                out.push(0);
            }
        }

        if let Some(entry) = self.entry_fileoff {
            push_u32(&mut out, LC_MAIN);
            push_u32(&mut out, 24);
            push_u64(&mut out, entry);
            push_u64(&mut out, 0); // stack size
        }

        assert_eq!(out.len(), 32 + sizeofcmds, "command layout drifted");

        for segment in &self.segments {
            out.extend_from_slice(&segment.data);
        }
        out.extend_from_slice(&self.rebase);
        out.extend_from_slice(&self.bind);
        out.extend_from_slice(&self.lazy);
        out.extend_from_slice(&self.export);
        out
    }
}

/// A library exporting `entries` at offsets inside one data segment linked
/// at `vmaddr`.
pub fn library(vmaddr: u64, entries: &[(&str, u64)]) -> Vec<u8> {
    MachBuilder::new()
        .data_segment(vmaddr, 0x1000, vec![0u8; 0x200])
        .exports(entries)
        .build()
}
