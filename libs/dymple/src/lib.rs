//! Dymple, the userspace Mach-O dynamic linker.
//!
//! Loads an image and its transitive dependencies from a [`Volume`], maps
//! segments into image-private memory, applies rebase and bind relocations,
//! resolves exports through the compressed export trie, and performs lazy
//! stub binds on first call.
//!
//! # Usage
//! ```no_run
//! use anillo_std::volume::FsVolume;
//!
//! let linker = dymple::Linker::new(FsVolume::new());
//! let image = linker.load("/system/lib/libsimple.dylib").unwrap();
//! let addr = linker.resolve(image, "simple_init").unwrap();
//! ```
//!
//! One process-wide lock (the API lock) serializes loads, lookups, and
//! lazy binds; fine-grained locking is deliberately out of scope.

mod bind;
mod exports;
mod image;
mod leb;
pub mod macho;
mod rebase;

pub use image::{ImageId, LoadState, Section, Segment};

use anillo_std::volume::Volume;
use anillo_std::{Kind, Result};
use image::Image;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Where image regions are placed; bumped per load with a guard gap.
const IMAGE_REGION_BASE: u64 = 0x2_0000_0000;
const IMAGE_REGION_GAP: u64 = 0x4000;
const PAGE_MASK: u64 = 0xFFF;

/// Linker state behind the API lock: the image arena and the path map.
pub(crate) struct LinkerState {
    images: Vec<Option<Image>>,
    by_path: HashMap<String, ImageId>,
    next_base: u64,
}

impl LinkerState {
    fn new() -> Self {
        LinkerState {
            images: Vec::new(),
            by_path: HashMap::new(),
            next_base: IMAGE_REGION_BASE,
        }
    }

    pub(crate) fn image(&self, id: ImageId) -> Result<&Image> {
        self.images
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or(Kind::NoSuchResource)
    }

    pub(crate) fn image_mut(&mut self, id: ImageId) -> Result<&mut Image> {
        self.images
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or(Kind::NoSuchResource)
    }

    /// The image whose mapped region contains `addr`.
    fn image_containing(&self, addr: u64) -> Option<ImageId> {
        self.images.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|image| image.contains(addr))
                .map(|_| ImageId(i))
        })
    }

    fn alloc_base(&mut self, size: u64) -> u64 {
        let base = self.next_base;
        let aligned = (size + PAGE_MASK) & !PAGE_MASK;
        self.next_base = base + aligned + IMAGE_REGION_GAP;
        base
    }

    /// Image for a bind ordinal: 0 is the image itself, positive ordinals
    /// index the dependency list in load order. Negative specials (main
    /// executable, flat, weak lookup) are not supported.
    pub(crate) fn resolve_ordinal(&self, id: ImageId, ordinal: i64) -> Result<ImageId> {
        if ordinal == 0 {
            return Ok(id);
        }
        if ordinal < 0 {
            return Err(Kind::Unsupported);
        }
        self.image(id)?
            .dependencies
            .get(ordinal as usize - 1)
            .copied()
            .ok_or(Kind::InvalidArgument)
    }

    /// Resolve an exported symbol to an absolute address through the
    /// image's export trie, caching the result. Absence is an error, never
    /// a silent zero.
    pub(crate) fn resolve_export(&mut self, id: ImageId, name: &str) -> Result<u64> {
        if let Some(&addr) = self.image(id)?.exports.get(name) {
            return Ok(addr);
        }
        let image = self.image(id)?;
        let offset = exports::lookup(&image.export_trie, name)?.ok_or(Kind::NoSuchResource)?;
        let addr = image.base + offset;
        self.image_mut(id)?.exports.insert(name.to_string(), addr);
        Ok(addr)
    }
}

/// The dynamic linker: an image arena over a file volume.
pub struct Linker<V: Volume> {
    volume: V,
    state: Mutex<LinkerState>,
}

impl<V: Volume> Linker<V> {
    pub fn new(volume: V) -> Self {
        Linker {
            volume,
            state: Mutex::new(LinkerState::new()),
        }
    }

    /// Load the image at `path` and its transitive dependencies.
    /// Idempotent: a path already in the images map returns the cached
    /// image without touching the volume.
    pub fn load(&self, path: &str) -> Result<ImageId> {
        let mut state = self.state.lock();
        load_inner(&mut state, &self.volume, path)
    }

    /// Resolve an exported symbol of a loaded image to its address.
    pub fn resolve(&self, image: ImageId, symbol: &str) -> Result<u64> {
        let mut state = self.state.lock();
        state.resolve_export(image, symbol)
    }

    /// Lazy-bind entry point called by a stub on its first invocation.
    ///
    /// `cell_addr` points at the stub's image-handle cell inside the
    /// calling image; the linker finds the owning image by address
    /// containment and caches its handle in the cell. `lazy_offset` selects
    /// the single bind run inside the image's lazy-bind bytes; the bound
    /// target address is returned for the stub to jump to.
    pub fn bind_stub(&self, cell_addr: u64, lazy_offset: u64) -> Result<u64> {
        let mut state = self.state.lock();

        let id = match state.image_containing(cell_addr) {
            Some(owner) => {
                let cached = state.image(owner)?.read_u64(cell_addr)?;
                if cached != 0 {
                    let id = ImageId(cached as usize - 1);
                    state.image(id)?;
                    id
                } else {
                    state
                        .image_mut(owner)?
                        .write_u64(cell_addr, owner.0 as u64 + 1)?;
                    owner
                }
            }
            None => return Err(Kind::NoSuchResource),
        };

        bind::bind_lazy(&mut state, id, lazy_offset as usize)
    }

    /// Entry-point address of a loaded image, if it has one.
    pub fn entry_point(&self, image: ImageId) -> Result<Option<u64>> {
        Ok(self.state.lock().image(image)?.entry_point)
    }

    /// Base address of a loaded image's mapped region.
    pub fn base_address(&self, image: ImageId) -> Result<u64> {
        Ok(self.state.lock().image(image)?.base)
    }

    /// Mapped region size of a loaded image.
    pub fn image_size(&self, image: ImageId) -> Result<u64> {
        Ok(self.state.lock().image(image)?.size)
    }

    /// Canonical path of a loaded image.
    pub fn image_path(&self, image: ImageId) -> Result<String> {
        Ok(self.state.lock().image(image)?.path.clone())
    }

    /// Load state of an image.
    pub fn state_of(&self, image: ImageId) -> Result<LoadState> {
        Ok(self.state.lock().image(image)?.state)
    }

    /// Dependency edges (load order) of an image.
    pub fn dependencies(&self, image: ImageId) -> Result<Vec<ImageId>> {
        Ok(self.state.lock().image(image)?.dependencies.clone())
    }

    /// Dependent back-edges of an image.
    pub fn dependents(&self, image: ImageId) -> Result<Vec<ImageId>> {
        Ok(self.state.lock().image(image)?.dependents.clone())
    }

    /// Read a word out of a loaded image's memory. Inspection for stubs
    /// and tests.
    pub fn read_u64(&self, image: ImageId, addr: u64) -> Result<u64> {
        self.state.lock().image(image)?.read_u64(addr)
    }

    /// Copy bytes out of a loaded image's memory.
    pub fn read_bytes(&self, image: ImageId, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.state.lock().image(image)?.read_bytes(addr, buf)
    }
}

/// Load one image, recursing into dependencies. The map entry is inserted
/// before segments load so dependency cycles short-circuit on the map hit;
/// any failure removes both the entry and the record.
fn load_inner<V: Volume>(state: &mut LinkerState, volume: &V, path: &str) -> Result<ImageId> {
    if path.starts_with('@') {
        // @rpath / @loader_path / @executable_path resolution is not
        // supported; install names are absolute volume paths.
        return Err(Kind::Unsupported);
    }
    if let Some(&id) = state.by_path.get(path) {
        return Ok(id);
    }

    let id = ImageId(state.images.len());
    state.images.push(Some(Image::new(path.to_string())));
    state.by_path.insert(path.to_string(), id);

    match load_steps(state, volume, id, path) {
        Ok(()) => {
            log::debug!(
                "[dymple] loaded {} at {:#x}",
                path,
                state.image(id)?.base
            );
            Ok(id)
        }
        Err(kind) => {
            // Destroy the partial image and drop the map entry; resources
            // owned by the record go with it.
            state.by_path.remove(path);
            state.images[id.0] = None;
            log::debug!("[dymple] load of {} failed: {}", path, kind);
            Err(kind)
        }
    }
}

fn load_steps<V: Volume>(
    state: &mut LinkerState,
    volume: &V,
    id: ImageId,
    path: &str,
) -> Result<()> {
    let file = volume.open_by_name(path)?;
    let canonical = volume.copy_path(file)?;

    // Header.
    let mut header_bytes = [0u8; macho::MACH_HEADER_64_LEN];
    volume.read_exact(file, 0, &mut header_bytes)?;
    let header = macho::MachHeader::parse(&header_bytes)?;
    state.image_mut(id)?.state = LoadState::HeaderRead;

    // Load commands.
    let mut command_bytes = vec![0u8; header.sizeofcmds as usize];
    volume.read_exact(file, macho::MACH_HEADER_64_LEN as u64, &mut command_bytes)?;
    let commands = macho::parse_load_commands(&header, &command_bytes)?;
    log::trace!(
        "[dymple] {}: filetype {} cputype {:#x} flags {:#x} symtab {:?}",
        canonical,
        header.filetype,
        header.cputype,
        header.flags,
        commands.symtab.map(|s| s.nsyms),
    );

    // Address range over mapped segments. Zero-protection reserve segments
    // keep their index slot but contribute nothing to the range.
    let mut low = u64::MAX;
    let mut high = 0u64;
    for segment in &commands.segments {
        if segment.maxprot == 0 {
            log::debug!(
                "[dymple] {}: skipping reserve segment {}",
                canonical,
                segment.name
            );
            continue;
        }
        low = low.min(segment.vmaddr);
        high = high.max(segment.vmaddr + segment.vmsize);
    }
    if low >= high {
        return Err(Kind::InvalidArgument);
    }
    let size = high - low;
    let base = state.alloc_base(size);

    // Map: load file bytes, zero-fill each segment to its vmsize.
    let mut memory = vec![0u8; size as usize];
    let mut segments = Vec::with_capacity(commands.segments.len());
    let mut sections = Vec::new();
    for segment in &commands.segments {
        let mapped = segment.maxprot != 0;
        if mapped {
            if segment.filesize > segment.vmsize {
                return Err(Kind::InvalidArgument);
            }
            let at = segment
                .vmaddr
                .checked_sub(low)
                .ok_or(Kind::InvalidArgument)? as usize;
            let end = at
                .checked_add(segment.filesize as usize)
                .ok_or(Kind::InvalidArgument)?;
            if end > memory.len() {
                return Err(Kind::InvalidArgument);
            }
            volume.read_exact(file, segment.fileoff, &mut memory[at..end])?;
            for section in &segment.sections {
                let section_slide = section
                    .addr
                    .checked_sub(low)
                    .ok_or(Kind::InvalidArgument)?;
                sections.push(Section {
                    name: section.name.clone(),
                    segment_name: section.segment_name.clone(),
                    file_offset: u64::from(section.offset),
                    base: base + section_slide,
                    size: section.size,
                });
            }
        }
        segments.push(Segment {
            name: segment.name.clone(),
            vmaddr: segment.vmaddr,
            vmsize: segment.vmsize,
            fileoff: segment.fileoff,
            filesize: segment.filesize,
            base: if mapped { base + (segment.vmaddr - low) } else { 0 },
            mapped,
        });
    }
    {
        let image = state.image_mut(id)?;
        image.base = base;
        image.file_load_base = low;
        image.size = size;
        image.memory = memory;
        image.segments = segments;
        image.sections = sections;
        image.state = LoadState::SegmentsMapped;
    }

    // Dynamic linker info: copy each byte range into an owned buffer.
    if let Some(info) = commands.dyld_info {
        let read_blob = |off: u32, size: u32| -> Result<Vec<u8>> {
            let mut blob = vec![0u8; size as usize];
            if size > 0 {
                volume.read_exact(file, u64::from(off), &mut blob)?;
            }
            Ok(blob)
        };
        let rebase = read_blob(info.rebase_off, info.rebase_size)?;
        let bind = read_blob(info.bind_off, info.bind_size)?;
        let weak = read_blob(info.weak_bind_off, info.weak_bind_size)?;
        let lazy = read_blob(info.lazy_bind_off, info.lazy_bind_size)?;
        let export = read_blob(info.export_off, info.export_size)?;
        let image = state.image_mut(id)?;
        image.rebase_bytes = rebase;
        image.bind_bytes = bind;
        image.weak_bind_bytes = weak;
        image.lazy_bind_bytes = lazy;
        image.export_trie = export;
    }
    state.image_mut(id)?.state = LoadState::LinkerInfoLoaded;

    // Entry point: map the entry file offset through the loaded sections.
    if let Some(entry_offset) = commands.entry_offset {
        let image = state.image_mut(id)?;
        let entry = image
            .sections
            .iter()
            .find(|s| {
                entry_offset >= s.file_offset && entry_offset < s.file_offset + s.size
            })
            .map(|s| s.base + (entry_offset - s.file_offset))
            .ok_or(Kind::InvalidArgument)?;
        image.entry_point = Some(entry);
    }

    // Dependencies, with bidirectional edges. Cycles are legal: the map
    // entry for this image already exists, so a cyclic dependent resolves
    // straight back to it.
    for dylib in &commands.dylibs {
        let dep = load_inner(state, volume, dylib)?;
        state.image_mut(id)?.dependencies.push(dep);
        state.image_mut(dep)?.dependents.push(id);
    }
    state.image_mut(id)?.state = LoadState::DependenciesLoaded;

    // The exports cache starts empty and fills per successful lookup.
    state.image_mut(id)?.state = LoadState::ExportsInited;

    // Relocate: rebase, then bind.
    rebase::apply(state.image_mut(id)?)?;
    bind::apply(state, id)?;
    state.image_mut(id)?.state = LoadState::Relocated;

    state.image_mut(id)?.state = LoadState::Ready;
    Ok(())
}
