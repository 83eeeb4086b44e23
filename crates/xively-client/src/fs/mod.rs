//! Filesystem abstraction.
//!
//! Certificates, downloaded files and their revisions are stored through
//! this trait so the client runs the same on a board with a memory-backed
//! store and on a host with a real directory.

mod memory;
mod posix;

use bytes::Bytes;

use crate::state::Result;

pub use memory::MemoryFs;
pub use posix::PosixFs;

/// Open file handle issued by a [`Filesystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsHandle(pub u32);

/// Access requested when opening a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
    };
    /// Create or truncate.
    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
    };
}

/// Resource metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub size: usize,
}

/// Storage backend.
///
/// Missing resources are [`State::FsResourceNotAvailable`](crate::State::FsResourceNotAvailable);
/// writing a read-only resource is [`State::FsOpenReadOnly`](crate::State::FsOpenReadOnly).
pub trait Filesystem {
    fn stat(&mut self, name: &str) -> Result<FsStat>;
    fn open(&mut self, name: &str, flags: OpenFlags) -> Result<FsHandle>;
    /// Read up to `max` bytes at `offset`. An empty result is end of file.
    fn read(&mut self, handle: FsHandle, offset: usize, max: usize) -> Result<Bytes>;
    fn write(&mut self, handle: FsHandle, offset: usize, data: &[u8]) -> Result<usize>;
    fn close(&mut self, handle: FsHandle) -> Result<()>;
    fn remove(&mut self, name: &str) -> Result<()>;
    /// Handles currently open.
    fn open_count(&self) -> usize;
}

/// Read a whole resource in one go.
pub fn read_all(fs: &mut dyn Filesystem, name: &str) -> Result<Bytes> {
    let stat = fs.stat(name)?;
    let handle = fs.open(name, OpenFlags::READ)?;
    let result = fs.read(handle, 0, stat.size);
    let closed = fs.close(handle);
    let data = result?;
    closed?;
    Ok(data)
}

/// Replace a resource with `data`.
pub fn write_all(fs: &mut dyn Filesystem, name: &str, data: &[u8]) -> Result<()> {
    let handle = fs.open(name, OpenFlags::WRITE)?;
    let result = fs.write(handle, 0, data);
    let closed = fs.close(handle);
    result?;
    closed
}
