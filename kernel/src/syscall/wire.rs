//! Channel-message wire format at the kernel/userspace boundary.
//!
//! The attachments region of a message is a chain of variable-length
//! records. Every record starts with a common header of three
//! little-endian fields: `next_offset` (record start to next record start,
//! 0 for the last), `length` (record byte length), and a type tag. Copied
//! data payloads live in the same region after the records; their record
//! points at them by region offset.
//!
//! Layouts must match `libs/stdlib/src/channel.rs`.

use crate::error::{Kind, Result};

/// Attachment type tags.
pub const ATTACHMENT_TYPE_NULL: u8 = 1;
pub const ATTACHMENT_TYPE_CHANNEL: u8 = 2;
pub const ATTACHMENT_TYPE_MAPPING: u8 = 3;
pub const ATTACHMENT_TYPE_DATA: u8 = 4;

/// Data-attachment flag: backed by a shared mapping rather than copied.
pub const DATA_FLAG_SHARED: u64 = 1 << 0;

/// Common record header: next_offset u64, length u64, type u8 + padding.
pub const RECORD_HEADER_LEN: usize = 24;
/// Record lengths by type.
pub const NULL_RECORD_LEN: usize = RECORD_HEADER_LEN;
pub const CHANNEL_RECORD_LEN: usize = RECORD_HEADER_LEN + 8;
pub const MAPPING_RECORD_LEN: usize = RECORD_HEADER_LEN + 8;
pub const DATA_RECORD_LEN: usize = RECORD_HEADER_LEN + 24;

/// One decoded attachment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Null,
    /// Descriptor ID of the channel being transferred (send) or just
    /// installed (receive).
    Channel { descriptor: u64 },
    /// Descriptor ID of the shared mapping.
    Mapping { descriptor: u64 },
    /// A data attachment. `target` is a mapping descriptor ID when `shared`,
    /// otherwise the payload's byte offset inside the attachments region.
    Data { shared: bool, len: u64, target: u64 },
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    let end = offset.checked_add(8).ok_or(Kind::InvalidArgument)?;
    let slice = bytes.get(offset..end).ok_or(Kind::InvalidArgument)?;
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decode every record in an attachments region, in chain order.
///
/// Rejects malformed chains: records out of bounds, lengths shorter than
/// the type requires, backwards links, and unknown type tags.
pub fn decode(region: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    if region.is_empty() {
        return Ok(records);
    }
    let mut at = 0usize;
    loop {
        let next_offset = read_u64(region, at)?;
        let length = read_u64(region, at + 8)? as usize;
        let type_tag = *region.get(at + 16).ok_or(Kind::InvalidArgument)?;
        if length < RECORD_HEADER_LEN || at.checked_add(length).ok_or(Kind::InvalidArgument)? > region.len() {
            return Err(Kind::InvalidArgument);
        }
        let record = match type_tag {
            ATTACHMENT_TYPE_NULL => Record::Null,
            ATTACHMENT_TYPE_CHANNEL => {
                if length < CHANNEL_RECORD_LEN {
                    return Err(Kind::InvalidArgument);
                }
                Record::Channel { descriptor: read_u64(region, at + RECORD_HEADER_LEN)? }
            }
            ATTACHMENT_TYPE_MAPPING => {
                if length < MAPPING_RECORD_LEN {
                    return Err(Kind::InvalidArgument);
                }
                Record::Mapping { descriptor: read_u64(region, at + RECORD_HEADER_LEN)? }
            }
            ATTACHMENT_TYPE_DATA => {
                if length < DATA_RECORD_LEN {
                    return Err(Kind::InvalidArgument);
                }
                let flags = read_u64(region, at + RECORD_HEADER_LEN)?;
                let len = read_u64(region, at + RECORD_HEADER_LEN + 8)?;
                let target = read_u64(region, at + RECORD_HEADER_LEN + 16)?;
                Record::Data { shared: flags & DATA_FLAG_SHARED != 0, len, target }
            }
            _ => return Err(Kind::InvalidArgument),
        };
        records.push(record);
        if next_offset == 0 {
            break;
        }
        let next = at
            .checked_add(next_offset as usize)
            .ok_or(Kind::InvalidArgument)?;
        if next <= at || next >= region.len() {
            return Err(Kind::InvalidArgument);
        }
        at = next;
    }
    Ok(records)
}

/// Byte length of one record by type.
pub fn record_len(record: &Record) -> usize {
    match record {
        Record::Null => NULL_RECORD_LEN,
        Record::Channel { .. } => CHANNEL_RECORD_LEN,
        Record::Mapping { .. } => MAPPING_RECORD_LEN,
        Record::Data { .. } => DATA_RECORD_LEN,
    }
}

/// Region size needed for `records` plus `copied_payload` bytes of
/// copied-data payloads appended after the chain.
pub fn region_size(records: &[Record], copied_payload: usize) -> usize {
    records.iter().map(record_len).sum::<usize>() + copied_payload
}

/// Encode a record chain into `region`. Copied-data payloads are written by
/// the caller at the offsets the records carry. Returns the byte length of
/// the encoded chain (payloads excluded).
pub fn encode(region: &mut [u8], records: &[Record]) -> Result<usize> {
    let chain_len = records.iter().map(record_len).sum::<usize>();
    if chain_len > region.len() {
        return Err(Kind::TooBig);
    }
    let mut at = 0usize;
    for (i, record) in records.iter().enumerate() {
        let length = record_len(record);
        let next_offset = if i + 1 == records.len() { 0 } else { length as u64 };
        write_u64(region, at, next_offset);
        write_u64(region, at + 8, length as u64);
        region[at + 16] = match record {
            Record::Null => ATTACHMENT_TYPE_NULL,
            Record::Channel { .. } => ATTACHMENT_TYPE_CHANNEL,
            Record::Mapping { .. } => ATTACHMENT_TYPE_MAPPING,
            Record::Data { .. } => ATTACHMENT_TYPE_DATA,
        };
        region[at + 17..at + RECORD_HEADER_LEN].fill(0);
        match record {
            Record::Null => {}
            Record::Channel { descriptor } | Record::Mapping { descriptor } => {
                write_u64(region, at + RECORD_HEADER_LEN, *descriptor);
            }
            Record::Data { shared, len, target } => {
                let flags = if *shared { DATA_FLAG_SHARED } else { 0 };
                write_u64(region, at + RECORD_HEADER_LEN, flags);
                write_u64(region, at + RECORD_HEADER_LEN + 8, *len);
                write_u64(region, at + RECORD_HEADER_LEN + 16, *target);
            }
        }
        at += length;
    }
    Ok(chain_len)
}
