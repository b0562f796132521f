//! Bind interpreter: eager binds at load time and single-run lazy binds
//! triggered by stubs.
//!
//! The bytecode updates `(type, segment index, segment offset, symbol,
//! library ordinal, addend)` state; each perform-bind resolves the symbol
//! through the ordinal's image export trie, adds the addend, and stores
//! according to the relocation type.

use crate::image::ImageId;
use crate::leb::{read_sleb, read_uleb};
use crate::macho::*;
use crate::LinkerState;
use anillo_std::{Kind, Result};

const POINTER_SIZE: u64 = 8;

#[derive(Debug, Clone)]
struct BindState {
    kind: u8,
    segment_index: usize,
    segment_offset: u64,
    symbol: String,
    symbol_flags: u8,
    ordinal: i64,
    addend: i64,
}

impl BindState {
    fn new() -> Self {
        BindState {
            kind: 0,
            segment_index: 0,
            segment_offset: 0,
            symbol: String::new(),
            symbol_flags: 0,
            ordinal: 0,
            addend: 0,
        }
    }
}

/// Apply an image's eager bind program. Returns the number of binds.
pub fn apply(state: &mut LinkerState, id: ImageId) -> Result<usize> {
    let bytes = std::mem::take(&mut state.image_mut(id)?.bind_bytes);
    let result = run(state, id, &bytes, 0, false).map(|(count, _)| count);
    state.image_mut(id)?.bind_bytes = bytes;
    result
}

/// Interpret the single lazy-bind run starting at `offset` and perform its
/// bind. Returns the bound target address.
pub fn bind_lazy(state: &mut LinkerState, id: ImageId, offset: usize) -> Result<u64> {
    let bytes = state.image(id)?.lazy_bind_bytes.clone();
    if offset >= bytes.len() {
        return Err(Kind::NoSuchResource);
    }
    let (_, bound) = run(state, id, &bytes, offset, true)?;
    bound.ok_or(Kind::InvalidArgument)
}

fn perform_bind(state: &mut LinkerState, id: ImageId, bind: &BindState) -> Result<u64> {
    let target = state.resolve_ordinal(id, bind.ordinal)?;
    let symbol_address = state.resolve_export(target, &bind.symbol)?;
    let value = (symbol_address as i64).wrapping_add(bind.addend) as u64;

    let addr = state
        .image(id)?
        .segment_address(bind.segment_index, bind.segment_offset)?;
    let image = state.image_mut(id)?;
    match bind.kind {
        BIND_TYPE_POINTER => image.write_u64(addr, value)?,
        BIND_TYPE_TEXT_ABSOLUTE32 => {
            if value > u64::from(u32::MAX) {
                return Err(Kind::InvalidArgument);
            }
            image.write_u32(addr, value as u32)?;
        }
        BIND_TYPE_TEXT_PCREL32 => {
            let rel = (value as i64).wrapping_sub((addr + 4) as i64);
            if rel > i64::from(i32::MAX) || rel < i64::from(i32::MIN) {
                return Err(Kind::InvalidArgument);
            }
            image.write_u32(addr, rel as i32 as u32)?;
        }
        _ => return Err(Kind::InvalidArgument),
    }
    log::trace!(
        "[dymple] bound {} -> {:#x} at {:#x}",
        bind.symbol,
        value,
        addr
    );
    Ok(value)
}

fn run(
    state: &mut LinkerState,
    id: ImageId,
    bytes: &[u8],
    start: usize,
    single: bool,
) -> Result<(usize, Option<u64>)> {
    let mut bind = BindState::new();
    let mut count = 0usize;
    let mut last = None;
    let mut pos = start;

    while pos < bytes.len() {
        let byte = bytes[pos];
        pos += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => {
                if single {
                    // A lazy run must reach its perform-bind.
                    return Err(Kind::InvalidArgument);
                }
                break;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => bind.ordinal = i64::from(immediate),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                bind.ordinal = read_uleb(bytes, &mut pos)? as i64;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                if immediate == 0 {
                    bind.ordinal = 0;
                } else {
                    // Negative specials: main-executable, flat, weak lookup.
                    return Err(Kind::Unsupported);
                }
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                bind.symbol_flags = immediate;
                let name_start = pos;
                let name_end = bytes[name_start..]
                    .iter()
                    .position(|&b| b == 0)
                    .map(|p| name_start + p)
                    .ok_or(Kind::InvalidArgument)?;
                bind.symbol =
                    String::from_utf8_lossy(&bytes[name_start..name_end]).into_owned();
                pos = name_end + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => bind.kind = immediate,
            BIND_OPCODE_SET_ADDEND_SLEB => bind.addend = read_sleb(bytes, &mut pos)?,
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                bind.segment_index = immediate as usize;
                bind.segment_offset = read_uleb(bytes, &mut pos)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                bind.segment_offset =
                    bind.segment_offset.wrapping_add(read_uleb(bytes, &mut pos)?);
            }
            BIND_OPCODE_DO_BIND => {
                let value = perform_bind(state, id, &bind)?;
                bind.segment_offset = bind.segment_offset.wrapping_add(POINTER_SIZE);
                count += 1;
                last = Some(value);
                if single {
                    return Ok((count, last));
                }
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                if single {
                    return Err(Kind::InvalidArgument);
                }
                let extra = read_uleb(bytes, &mut pos)?;
                let value = perform_bind(state, id, &bind)?;
                bind.segment_offset = bind
                    .segment_offset
                    .wrapping_add(POINTER_SIZE)
                    .wrapping_add(extra);
                count += 1;
                last = Some(value);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                if single {
                    return Err(Kind::InvalidArgument);
                }
                let value = perform_bind(state, id, &bind)?;
                bind.segment_offset = bind
                    .segment_offset
                    .wrapping_add(POINTER_SIZE)
                    .wrapping_add(u64::from(immediate) * POINTER_SIZE);
                count += 1;
                last = Some(value);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                if single {
                    return Err(Kind::InvalidArgument);
                }
                let times = read_uleb(bytes, &mut pos)?;
                let skip = read_uleb(bytes, &mut pos)?;
                for _ in 0..times {
                    let value = perform_bind(state, id, &bind)?;
                    bind.segment_offset = bind
                        .segment_offset
                        .wrapping_add(POINTER_SIZE)
                        .wrapping_add(skip);
                    count += 1;
                    last = Some(value);
                }
            }
            BIND_OPCODE_THREADED => {
                // Parsed but deliberately not implemented.
                return Err(Kind::Unsupported);
            }
            _ => return Err(Kind::InvalidArgument),
        }
    }
    if single {
        // Ran off the end without a perform-bind.
        return Err(Kind::InvalidArgument);
    }
    Ok((count, last))
}
