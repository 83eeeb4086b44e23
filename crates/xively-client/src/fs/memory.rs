use ahash::AHashMap;
use bytes::Bytes;

use super::{Filesystem, FsHandle, FsStat, OpenFlags};
use crate::state::{Result, State};

struct Entry {
    data: Vec<u8>,
    read_only: bool,
}

struct OpenFile {
    name: String,
    flags: OpenFlags,
}

/// In-memory filesystem. Entries can be marked read-only, as a certificate
/// bundle compiled into firmware would be.
#[derive(Default)]
pub struct MemoryFs {
    entries: AHashMap<String, Entry>,
    open: AHashMap<u32, OpenFile>,
    next_handle: u32,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a writable resource.
    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data, false);
        self
    }

    /// Add a read-only resource.
    pub fn with_read_only(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data, true);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>, read_only: bool) {
        self.entries.insert(
            name.into(),
            Entry {
                data: data.into(),
                read_only,
            },
        );
    }

    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|entry| entry.data.as_slice())
    }

    fn file(&self, handle: FsHandle) -> Result<&OpenFile> {
        self.open.get(&handle.0).ok_or(State::FsResourceNotAvailable)
    }
}

impl Filesystem for MemoryFs {
    fn stat(&mut self, name: &str) -> Result<FsStat> {
        self.entries
            .get(name)
            .map(|entry| FsStat {
                size: entry.data.len(),
            })
            .ok_or(State::FsResourceNotAvailable)
    }

    fn open(&mut self, name: &str, flags: OpenFlags) -> Result<FsHandle> {
        match self.entries.get_mut(name) {
            Some(entry) if flags.write && entry.read_only => return Err(State::FsOpenReadOnly),
            Some(entry) if flags.write => entry.data.clear(),
            Some(_) => {}
            None if flags.write => self.insert(name, Vec::new(), false),
            None => return Err(State::FsResourceNotAvailable),
        }
        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = self.next_handle;
        self.open.insert(
            handle,
            OpenFile {
                name: name.to_string(),
                flags,
            },
        );
        Ok(FsHandle(handle))
    }

    fn read(&mut self, handle: FsHandle, offset: usize, max: usize) -> Result<Bytes> {
        let file = self.file(handle)?;
        if !file.flags.read {
            return Err(State::FsReadError);
        }
        let entry = self.entries.get(&file.name).ok_or(State::FsReadError)?;
        let start = offset.min(entry.data.len());
        let end = start.saturating_add(max).min(entry.data.len());
        Ok(Bytes::copy_from_slice(&entry.data[start..end]))
    }

    fn write(&mut self, handle: FsHandle, offset: usize, data: &[u8]) -> Result<usize> {
        let file = self.file(handle)?;
        if !file.flags.write {
            return Err(State::FsWriteError);
        }
        let name = file.name.clone();
        let entry = self.entries.get_mut(&name).ok_or(State::FsWriteError)?;
        let end = offset + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn close(&mut self, handle: FsHandle) -> Result<()> {
        self.open
            .remove(&handle.0)
            .map(drop)
            .ok_or(State::FsCloseError)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        match self.entries.get(name) {
            None => Err(State::FsResourceNotAvailable),
            Some(entry) if entry.read_only => Err(State::FsRemoveError),
            Some(_) => {
                self.entries.remove(name);
                Ok(())
            }
        }
    }

    fn open_count(&self) -> usize {
        self.open.len()
    }
}
