//! Loaded-image records.
//!
//! Images live in one arena; dependencies and dependents are index lists,
//! so library cycles are representable and never broken. The export trie
//! and lazy-bind bytes are copied out of the file at load time and never
//! change afterwards.

use anillo_std::{Kind, Result};
use std::collections::HashMap;

/// Arena index of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub usize);

/// Load progress. An image is usable only at `Ready`; the map entry of an
/// image that fails mid-path is removed along with the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    New,
    HeaderRead,
    SegmentsMapped,
    LinkerInfoLoaded,
    DependenciesLoaded,
    ExportsInited,
    Relocated,
    Ready,
}

/// One segment of a loaded image. Reserve segments (zero protection, e.g.
/// `__PAGEZERO`) keep their slot so bytecode segment indices line up, but
/// are never mapped.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    /// Link-time address from the segment command.
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    /// Actual base address after loading; 0 for unmapped reserve segments.
    pub base: u64,
    pub mapped: bool,
}

/// One section of a loaded image.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub file_offset: u64,
    pub base: u64,
    pub size: u64,
}

/// A loaded Mach-O image.
pub struct Image {
    /// Canonical path; also the images-map key.
    pub path: String,
    pub state: LoadState,
    /// Base address of the mapped region.
    pub base: u64,
    /// Address the on-disk image was linked to expect.
    pub file_load_base: u64,
    /// Mapped region size.
    pub size: u64,
    /// The mapped bytes, covering `[base, base + size)`.
    pub memory: Vec<u8>,
    pub segments: Vec<Segment>,
    pub sections: Vec<Section>,
    pub dependencies: Vec<ImageId>,
    pub dependents: Vec<ImageId>,
    pub rebase_bytes: Vec<u8>,
    pub bind_bytes: Vec<u8>,
    pub weak_bind_bytes: Vec<u8>,
    pub lazy_bind_bytes: Vec<u8>,
    pub export_trie: Vec<u8>,
    /// Resolved-symbol cache: name to absolute address.
    pub exports: HashMap<String, u64>,
    pub entry_point: Option<u64>,
    pub is_dymple: bool,
}

impl Image {
    pub fn new(path: String) -> Image {
        let is_dymple = path
            .rsplit('/')
            .next()
            .map(|n| n.starts_with("libdymple"))
            .unwrap_or(false);
        Image {
            path,
            state: LoadState::New,
            base: 0,
            file_load_base: 0,
            size: 0,
            memory: Vec::new(),
            segments: Vec::new(),
            sections: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            rebase_bytes: Vec::new(),
            bind_bytes: Vec::new(),
            weak_bind_bytes: Vec::new(),
            lazy_bind_bytes: Vec::new(),
            export_trie: Vec::new(),
            exports: HashMap::new(),
            entry_point: None,
            is_dymple,
        }
    }

    /// True if `addr` falls inside the mapped region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn offset_of(&self, addr: u64, len: usize) -> Result<usize> {
        if !self.contains(addr) || !self.contains(addr + len as u64 - 1) {
            return Err(Kind::InvalidArgument);
        }
        Ok((addr - self.base) as usize)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let at = self.offset_of(addr, 8)?;
        Ok(u64::from_le_bytes(
            self.memory[at..at + 8].try_into().expect("8-byte slice"),
        ))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        let at = self.offset_of(addr, 8)?;
        self.memory[at..at + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let at = self.offset_of(addr, 4)?;
        Ok(u32::from_le_bytes(
            self.memory[at..at + 4].try_into().expect("4-byte slice"),
        ))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        let at = self.offset_of(addr, 4)?;
        self.memory[at..at + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy bytes out of the mapped region.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let at = self.offset_of(addr, buf.len())?;
        buf.copy_from_slice(&self.memory[at..at + buf.len()]);
        Ok(())
    }

    /// Address of `(segment_index, segment_offset)` as used by the rebase
    /// and bind bytecodes. Targeting a reserve segment is an error.
    pub fn segment_address(&self, segment_index: usize, segment_offset: u64) -> Result<u64> {
        let segment = self
            .segments
            .get(segment_index)
            .ok_or(Kind::InvalidArgument)?;
        if !segment.mapped {
            return Err(Kind::InvalidArgument);
        }
        if segment_offset >= segment.vmsize {
            return Err(Kind::InvalidArgument);
        }
        Ok(segment.base + segment_offset)
    }
}
