//! Processes and their descriptor tables.
//!
//! Every process owns a table mapping descriptor IDs to kernel objects of a
//! particular class. Descriptors hold strong references; install and
//! uninstall are atomic with respect to each other.

use crate::error::{Kind, Result};
use crate::ipc::channel::Channel;
use crate::memory::mapping::Mapping;
use crate::sync::spinlock::Spinlock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// A kernel object installed in a descriptor table, tagged by class.
#[derive(Clone)]
pub enum Descriptor {
    Channel(Arc<Channel>),
    Mapping(Arc<Mapping>),
    /// Threads are named by TID; the table entry holds one scheduler
    /// reference, released at uninstall.
    Thread(u64),
}

impl Descriptor {
    pub fn class_name(&self) -> &'static str {
        match self {
            Descriptor::Channel(_) => "channel",
            Descriptor::Mapping(_) => "mapping",
            Descriptor::Thread(_) => "thread",
        }
    }
}

/// A process: descriptor table plus identity. Threads belong to a process;
/// syscalls resolve handles through the calling thread's process.
pub struct Process {
    pid: u64,
    descriptors: Spinlock<HashMap<u64, Descriptor>>,
    next_descriptor: AtomicU64,
}

impl Process {
    pub fn new() -> Arc<Process> {
        Arc::new(Process {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            descriptors: Spinlock::new(HashMap::new()),
            next_descriptor: AtomicU64::new(1),
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Install an object, returning its new descriptor ID.
    pub fn install(&self, descriptor: Descriptor) -> u64 {
        let id = self.next_descriptor.fetch_add(1, Ordering::Relaxed);
        self.descriptors.lock().insert(id, descriptor);
        id
    }

    /// Remove a descriptor, returning the object it held.
    pub fn uninstall(&self, id: u64) -> Result<Descriptor> {
        self.descriptors
            .lock()
            .remove(&id)
            .ok_or(Kind::NoSuchResource)
    }

    /// Look up a descriptor without removing it.
    pub fn lookup(&self, id: u64) -> Result<Descriptor> {
        self.descriptors
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Kind::NoSuchResource)
    }

    /// Look up a descriptor that must be a channel.
    pub fn lookup_channel(&self, id: u64) -> Result<Arc<Channel>> {
        match self.lookup(id)? {
            Descriptor::Channel(ch) => Ok(ch),
            _ => Err(Kind::InvalidArgument),
        }
    }

    /// Look up a descriptor that must be a mapping.
    pub fn lookup_mapping(&self, id: u64) -> Result<Arc<Mapping>> {
        match self.lookup(id)? {
            Descriptor::Mapping(m) => Ok(m),
            _ => Err(Kind::InvalidArgument),
        }
    }

    /// Look up a descriptor that must be a thread.
    pub fn lookup_thread(&self, id: u64) -> Result<u64> {
        match self.lookup(id)? {
            Descriptor::Thread(tid) => Ok(tid),
            _ => Err(Kind::InvalidArgument),
        }
    }

    /// Number of descriptors in this table that refer to the given channel.
    /// The transfer path requires exactly one (sole ownership).
    pub fn channel_descriptor_count(&self, channel: &Arc<Channel>) -> usize {
        self.descriptors
            .lock()
            .values()
            .filter(|d| matches!(d, Descriptor::Channel(c) if Arc::ptr_eq(c, channel)))
            .count()
    }

    /// Number of installed descriptors.
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.lock().len()
    }
}
