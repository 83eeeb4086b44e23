//! Revisions of updateable files, stored next to them as `<name>.xirev`.

use log::debug;

use crate::control_topic::GENERATED_REVISION;
use crate::fs::{self, Filesystem};
use crate::state::{Result, State};

const SUFFIX: &str = ".xirev";
const PENDING_SUFFIX: &str = ".xirev.pending";

fn resource(name: &str) -> String {
    format!("{}{}", name, SUFFIX)
}

fn pending_resource(name: &str) -> String {
    format!("{}{}", name, PENDING_SUFFIX)
}

pub fn get(fs: &mut dyn Filesystem, name: &str) -> Result<String> {
    let data = fs::read_all(fs, &resource(name))?;
    String::from_utf8(data.to_vec()).map_err(|_| State::FsReadError)
}

pub fn set(fs: &mut dyn Filesystem, name: &str, revision: &str) -> Result<()> {
    fs::write_all(fs, &resource(name), revision.as_bytes())
}

/// Revision reported to the service: the stored one, or a generated
/// placeholder.
pub fn reported(fs: &mut dyn Filesystem, name: &str) -> String {
    match get(fs, name) {
        Ok(revision) => revision,
        Err(err) => {
            debug!("no revision for {}: {}", name, err);
            GENERATED_REVISION.to_string()
        }
    }
}

/// Remember the revision of a downloaded firmware image until it is
/// committed.
pub fn set_pending(fs: &mut dyn Filesystem, name: &str, revision: &str) -> Result<()> {
    fs::write_all(fs, &pending_resource(name), revision.as_bytes())
}

/// Make the pending firmware revision current. Applications call this once
/// the new image runs.
pub fn commit_pending(fs: &mut dyn Filesystem, name: &str) -> Result<()> {
    let pending = fs::read_all(fs, &pending_resource(name))?;
    fs::write_all(fs, &resource(name), &pending)?;
    fs.remove(&pending_resource(name))
}
