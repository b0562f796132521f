//! Shareable memory mappings.
//!
//! A mapping is a refcounted block of whole pages that processes share by
//! descriptor and that channel messages carry by reference. This is the
//! kernel-object face of the paging subsystem; the backing here is plain
//! heap memory.

use crate::error::{Kind, Result};
use crate::sync::spinlock::Spinlock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Page granularity for mapping sizes.
pub const PAGE_SIZE: usize = 4096;

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping").field("id", &self.id).finish()
    }
}

/// A refcounted, shareable block of pages.
pub struct Mapping {
    id: u64,
    pages: Spinlock<Vec<u8>>,
}

impl Mapping {
    /// Allocate a zero-filled mapping of `page_count` pages.
    pub fn new(page_count: usize) -> Result<Arc<Mapping>> {
        if page_count == 0 {
            return Err(Kind::InvalidArgument);
        }
        Ok(Arc::new(Mapping {
            id: NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed),
            pages: Spinlock::new(vec![0u8; page_count * PAGE_SIZE]),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes (always page-aligned).
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy bytes out of the mapping.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.lock();
        let end = offset.checked_add(buf.len()).ok_or(Kind::InvalidArgument)?;
        if end > pages.len() {
            return Err(Kind::InvalidArgument);
        }
        buf.copy_from_slice(&pages[offset..end]);
        Ok(())
    }

    /// Copy bytes into the mapping.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut pages = self.pages.lock();
        let end = offset.checked_add(data.len()).ok_or(Kind::InvalidArgument)?;
        if end > pages.len() {
            return Err(Kind::InvalidArgument);
        }
        pages[offset..end].copy_from_slice(data);
        Ok(())
    }
}
