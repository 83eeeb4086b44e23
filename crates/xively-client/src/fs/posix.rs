use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use log::error;

use super::{Filesystem, FsHandle, FsStat, OpenFlags};
use crate::state::{Result, State};

/// Filesystem rooted at a host directory.
pub struct PosixFs {
    root: PathBuf,
    open: AHashMap<u32, File>,
    next_handle: u32,
}

impl PosixFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: AHashMap::new(),
            next_handle: 0,
        }
    }

    /// Resource names are plain relative paths below the root.
    fn path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(State::InvalidParameter);
        }
        Ok(self.root.join(relative))
    }

    fn file(&mut self, handle: FsHandle) -> Result<&mut File> {
        self.open.get_mut(&handle.0).ok_or(State::FsResourceNotAvailable)
    }
}

fn not_found_or(err: io::Error, other: State) -> State {
    if err.kind() == io::ErrorKind::NotFound {
        State::FsResourceNotAvailable
    } else {
        other
    }
}

impl Filesystem for PosixFs {
    fn stat(&mut self, name: &str) -> Result<FsStat> {
        let meta = fs::metadata(self.path(name)?).map_err(|err| not_found_or(err, State::FsError))?;
        let size = usize::try_from(meta.len()).map_err(|_| State::FsError)?;
        Ok(FsStat { size })
    }

    fn open(&mut self, name: &str, flags: OpenFlags) -> Result<FsHandle> {
        let path = self.path(name)?;
        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .create(flags.write)
            .truncate(flags.write)
            .open(&path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::PermissionDenied if flags.write => State::FsOpenReadOnly,
                _ => not_found_or(err, State::FsOpenError),
            })?;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.open.insert(self.next_handle, file);
        Ok(FsHandle(self.next_handle))
    }

    fn read(&mut self, handle: FsHandle, offset: usize, max: usize) -> Result<Bytes> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|_| State::FsReadError)?;
        let mut buf = BytesMut::zeroed(max);
        let mut filled = 0;
        while filled < max {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("read failed: {}", err);
                    return Err(State::FsReadError);
                }
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    fn write(&mut self, handle: FsHandle, offset: usize, data: &[u8]) -> Result<usize> {
        let file = self.file(handle)?;
        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| file.write_all(data))
            .map_err(|err| {
                error!("write failed: {}", err);
                State::FsWriteError
            })?;
        Ok(data.len())
    }

    fn close(&mut self, handle: FsHandle) -> Result<()> {
        let mut file = self.open.remove(&handle.0).ok_or(State::FsCloseError)?;
        file.flush().map_err(|_| State::FsCloseError)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        fs::remove_file(self.path(name)?).map_err(|err| not_found_or(err, State::FsRemoveError))
    }

    fn open_count(&self) -> usize {
        self.open.len()
    }
}
