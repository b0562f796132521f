//! Export trie resolution.
//!
//! Exported names are stored as a compressed trie of byte suffixes. Each
//! node is: terminal-info size (ULEB), the terminal info when nonzero
//! (flags ULEB, then the offset-from-image-base ULEB for regular symbols),
//! a child count byte, and per child a NUL-terminated edge string plus the
//! child node's offset from the trie start (ULEB).

use crate::leb::read_uleb;
use crate::macho::{
    EXPORT_SYMBOL_FLAGS_KIND_MASK, EXPORT_SYMBOL_FLAGS_KIND_REGULAR,
    EXPORT_SYMBOL_FLAGS_REEXPORT, EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER,
};
use anillo_std::{Kind, Result};

/// Walk `trie` for `name`. `Ok(Some(offset))` yields the offset from the
/// image base; an absent name is `Ok(None)` so the caller reports the
/// failure (never a silent zero).
pub fn lookup(trie: &[u8], name: &str) -> Result<Option<u64>> {
    if trie.is_empty() {
        return Ok(None);
    }
    let mut remaining = name.as_bytes();
    let mut node = 0usize;
    // Each hop consumes at least one edge byte; this bounds malformed
    // self-referential tries.
    for _ in 0..=name.len() {
        let mut pos = node;
        let terminal_size = read_uleb(trie, &mut pos)? as usize;
        if remaining.is_empty() {
            if terminal_size == 0 {
                return Ok(None);
            }
            let flags = read_uleb(trie, &mut pos)?;
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0
                || flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0
                || flags & EXPORT_SYMBOL_FLAGS_KIND_MASK != EXPORT_SYMBOL_FLAGS_KIND_REGULAR
            {
                return Err(Kind::Unsupported);
            }
            let offset = read_uleb(trie, &mut pos)?;
            return Ok(Some(offset));
        }

        // Skip the terminal info to reach the children.
        let mut children = pos + terminal_size;
        let child_count = *trie.get(children).ok_or(Kind::InvalidArgument)?;
        children += 1;

        let mut next_node = None;
        for _ in 0..child_count {
            let edge_start = children;
            let edge_end = trie[edge_start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| edge_start + p)
                .ok_or(Kind::InvalidArgument)?;
            let edge = &trie[edge_start..edge_end];
            let mut after_edge = edge_end + 1;
            let child_offset = read_uleb(trie, &mut after_edge)? as usize;
            children = after_edge;

            if !edge.is_empty() && remaining.starts_with(edge) {
                remaining = &remaining[edge.len()..];
                next_node = Some(child_offset);
                break;
            }
        }
        match next_node {
            Some(n) if n < trie.len() => node = n,
            Some(_) => return Err(Kind::InvalidArgument),
            None => return Ok(None),
        }
    }
    Err(Kind::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb2(value: u64) -> [u8; 2] {
        assert!(value < 1 << 14);
        [(value as u8 & 0x7F) | 0x80, (value >> 7) as u8]
    }

    /// Flat trie: a non-terminal root whose children are whole names.
    /// Valid only for names that are not prefixes of one another; a real
    /// linker emits compressed shared-prefix edges instead.
    fn trie_of(entries: &[(&str, u64)]) -> Vec<u8> {
        let mut root = vec![0u8, entries.len() as u8];
        let root_len: usize =
            2 + entries.iter().map(|(n, _)| n.len() + 1 + 2).sum::<usize>();
        let mut nodes = Vec::new();
        let mut node_at = root_len;
        for (name, offset) in entries {
            root.extend_from_slice(name.as_bytes());
            root.push(0);
            root.extend_from_slice(&uleb2(node_at as u64));
            let node = {
                let mut n = vec![4u8];
                n.extend_from_slice(&uleb2(0)); // flags: regular
                n.extend_from_slice(&uleb2(*offset));
                n.push(0); // no children
                n
            };
            node_at += node.len();
            nodes.push(node);
        }
        root.extend(nodes.into_iter().flatten());
        root
    }

    #[test]
    fn test_lookup_finds_entries() {
        let trie = trie_of(&[("foo", 0x100), ("bar", 0x200), ("qux", 0x300)]);
        assert_eq!(lookup(&trie, "foo").unwrap(), Some(0x100));
        assert_eq!(lookup(&trie, "qux").unwrap(), Some(0x300));
        assert_eq!(lookup(&trie, "missing").unwrap(), None);
        assert_eq!(lookup(&trie, "fo").unwrap(), None);
    }

    #[test]
    fn test_shared_prefix_edges() {
        // Root --"foo"--> node (terminal, 0x10) --"bar"--> node (terminal 0x20).
        // Built by hand with 2-byte ULEBs.
        let mut trie = Vec::new();
        // Root: no terminal, one child "foo".
        trie.extend_from_slice(&[0x00, 0x01]);
        trie.extend_from_slice(b"foo\0");
        trie.extend_from_slice(&uleb2(8));
        assert_eq!(trie.len(), 8, "\"foo\" node starts here");
        // "foo" node: terminal (flags 0, offset 0x10), one child "bar".
        trie.push(4);
        trie.extend_from_slice(&uleb2(0));
        trie.extend_from_slice(&uleb2(0x10));
        trie.push(1);
        trie.extend_from_slice(b"bar\0");
        trie.extend_from_slice(&uleb2(20));
        assert_eq!(trie.len(), 20, "\"foobar\" node starts here");
        // "foobar" node: terminal (flags 0, offset 0x20), no children.
        trie.push(4);
        trie.extend_from_slice(&uleb2(0));
        trie.extend_from_slice(&uleb2(0x20));
        trie.push(0);

        assert_eq!(lookup(&trie, "foo").unwrap(), Some(0x10));
        assert_eq!(lookup(&trie, "foobar").unwrap(), Some(0x20));
        assert_eq!(lookup(&trie, "foob").unwrap(), None);
    }

    #[test]
    fn test_unsupported_terminal_kinds() {
        // Terminal with the re-export flag set.
        let mut trie = vec![0x00, 0x01];
        trie.extend_from_slice(b"x\0");
        trie.extend_from_slice(&uleb2(6));
        assert_eq!(trie.len(), 6);
        trie.push(4);
        trie.extend_from_slice(&uleb2(EXPORT_SYMBOL_FLAGS_REEXPORT));
        trie.extend_from_slice(&uleb2(0));
        trie.push(0);
        assert_eq!(lookup(&trie, "x").err(), Some(Kind::Unsupported));
    }

    #[test]
    fn test_empty_trie() {
        assert_eq!(lookup(&[], "anything").unwrap(), None);
    }
}
