//! File-access primitives.
//!
//! The dynamic linker and other services read files through the [`Volume`]
//! trait: open by absolute name, exact-length reads at arbitrary offsets,
//! and path recovery from an open file. Short reads are errors, never
//! partial successes.

use crate::error::{Kind, Result};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Mutex;

/// Handle to an open file within one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub u64);

/// A source of files addressed by absolute path.
pub trait Volume {
    /// Open a file by name. Missing files are `no_such_resource`.
    fn open_by_name(&self, name: &str) -> Result<FileId>;

    /// Read exactly `buf.len()` bytes at `offset`. A read past the end of
    /// the file is `invalid_argument`.
    fn read_exact(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// The canonical path this file was opened under.
    fn copy_path(&self, file: FileId) -> Result<String>;

    /// Total file size in bytes.
    fn file_size(&self, file: FileId) -> Result<u64>;
}

/// In-memory volume: a path-to-bytes map. The test backend, and the shape
/// a ramdisk service presents.
#[derive(Default)]
pub struct MemVolume {
    files: Mutex<HashMap<String, Vec<u8>>>,
    open: Mutex<Vec<String>>,
}

impl MemVolume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), bytes);
    }

    fn path_of(&self, file: FileId) -> Result<String> {
        self.open
            .lock()
            .unwrap()
            .get(file.0 as usize)
            .cloned()
            .ok_or(Kind::InvalidArgument)
    }
}

impl Volume for MemVolume {
    fn open_by_name(&self, name: &str) -> Result<FileId> {
        if !self.files.lock().unwrap().contains_key(name) {
            return Err(Kind::NoSuchResource);
        }
        let mut open = self.open.lock().unwrap();
        open.push(name.to_string());
        Ok(FileId(open.len() as u64 - 1))
    }

    fn read_exact(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.path_of(file)?;
        let files = self.files.lock().unwrap();
        let bytes = files.get(&path).ok_or(Kind::NoSuchResource)?;
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Kind::InvalidArgument)?;
        if end > bytes.len() {
            return Err(Kind::InvalidArgument);
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn copy_path(&self, file: FileId) -> Result<String> {
        self.path_of(file)
    }

    fn file_size(&self, file: FileId) -> Result<u64> {
        let path = self.path_of(file)?;
        let files = self.files.lock().unwrap();
        Ok(files.get(&path).ok_or(Kind::NoSuchResource)?.len() as u64)
    }
}

/// Volume backed by the host filesystem.
#[derive(Default)]
pub struct FsVolume {
    open: Mutex<Vec<PathBuf>>,
}

impl FsVolume {
    pub fn new() -> Self {
        Self::default()
    }

    fn path_of(&self, file: FileId) -> Result<PathBuf> {
        self.open
            .lock()
            .unwrap()
            .get(file.0 as usize)
            .cloned()
            .ok_or(Kind::InvalidArgument)
    }
}

impl Volume for FsVolume {
    fn open_by_name(&self, name: &str) -> Result<FileId> {
        let path = PathBuf::from(name);
        if !path.is_file() {
            return Err(Kind::NoSuchResource);
        }
        log::trace!("[volume] open {}", name);
        let mut open = self.open.lock().unwrap();
        open.push(path);
        Ok(FileId(open.len() as u64 - 1))
    }

    fn read_exact(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.path_of(file)?;
        let mut f = std::fs::File::open(path).map_err(|_| Kind::NoSuchResource)?;
        f.seek(SeekFrom::Start(offset)).map_err(|_| Kind::InvalidArgument)?;
        f.read_exact(buf).map_err(|_| Kind::InvalidArgument)?;
        Ok(())
    }

    fn copy_path(&self, file: FileId) -> Result<String> {
        let path = self.path_of(file)?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn file_size(&self, file: FileId) -> Result<u64> {
        let path = self.path_of(file)?;
        let meta = std::fs::metadata(path).map_err(|_| Kind::NoSuchResource)?;
        Ok(meta.len())
    }
}
