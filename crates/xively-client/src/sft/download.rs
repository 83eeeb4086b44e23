//! An update package being downloaded: the offered files, the order they
//! are fetched in and the progress of the current one.

use sha2::{Digest, Sha256};

use crate::control_topic::FileDescExt;
use crate::fs::FsHandle;
use crate::state::{Result, State};

/// Chunked download of one file over MQTT.
pub(crate) struct ChunkDownload {
    pub file: Option<FsHandle>,
    pub offset: u32,
    hasher: Sha256,
}

impl ChunkDownload {
    pub fn new() -> Self {
        Self {
            file: None,
            offset: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.offset = self.offset.saturating_add(chunk.len() as u32);
    }

    /// Whether the received bytes hash to `fingerprint`.
    pub fn verify(self, fingerprint: &[u8]) -> bool {
        self.hasher.finalize().as_slice() == fingerprint
    }
}

/// Files offered by one FILE_UPDATE_AVAILABLE.
pub struct UpdatePackage {
    pub(crate) files: Vec<FileDescExt>,
    /// Indexes into `files`, consumed front to back. `-1` marks a slot
    /// that is skipped or already taken.
    pub(crate) download_order: Option<Vec<i32>>,
    pub(crate) current: Option<usize>,
    pub(crate) firmware: Option<usize>,
    pub(crate) download: Option<ChunkDownload>,
}

impl UpdatePackage {
    pub fn new(files: Vec<FileDescExt>, download_order: Option<Vec<i32>>) -> Self {
        Self {
            files,
            download_order,
            current: None,
            firmware: None,
            download: None,
        }
    }

    pub fn files(&self) -> &[FileDescExt] {
        &self.files
    }

    pub fn current_file(&self) -> Option<&FileDescExt> {
        self.current.and_then(|index| self.files.get(index))
    }

    pub fn firmware_file(&self) -> Option<&FileDescExt> {
        self.firmware.and_then(|index| self.files.get(index))
    }

    /// Take the first slot of the download order that names a file.
    ///
    /// With nothing left the current file becomes `None`. A package without
    /// a download order is an internal error and keeps its current file.
    pub fn select_next_resource_to_download(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.current = None;
            return Ok(());
        }
        let order = self.download_order.as_mut().ok_or(State::InternalError)?;
        let file_count = self.files.len();
        let slot = order
            .iter_mut()
            .find(|index| usize::try_from(**index).is_ok_and(|index| index < file_count));
        self.current = match slot {
            Some(index) => {
                let selected = *index as usize;
                *index = -1;
                Some(selected)
            }
            None => None,
        };
        Ok(())
    }
}

/// Download order for `files`: updateable files in the order offered,
/// firmware last, files the device does not accept skipped. An empty
/// `updateable` list accepts every file.
pub fn download_order(
    files: &[FileDescExt],
    updateable: &[String],
    is_firmware: impl Fn(&str) -> bool,
) -> Vec<i32> {
    let accepted = |file: &FileDescExt| updateable.is_empty() || updateable.iter().any(|name| *name == file.name);
    let (firmware, regular): (Vec<usize>, Vec<usize>) = files
        .iter()
        .enumerate()
        .filter(|(_, file)| accepted(file))
        .map(|(index, _)| index)
        .partition(|index| is_firmware(&files[*index].name));
    let mut order: Vec<i32> = regular.into_iter().chain(firmware).map(|index| index as i32).collect();
    order.resize(files.len(), -1);
    order
}
