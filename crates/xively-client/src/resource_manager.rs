//! Asynchronous access to filesystem resources.
//!
//! Each operation runs on the dispatcher and reports through a callback.
//! Reads are split into chunks with a dispatcher yield in between, so a
//! large certificate bundle never stalls the event loop. A resource context
//! accepts one operation at a time.

use bytes::{Bytes, BytesMut};
use log::{debug, error, trace};

use crate::client::Xively;
use crate::fs::{FsHandle, OpenFlags};
use crate::state::{Result, State};

/// Bytes read per dispatcher turn.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Handle of an open resource context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub i32);

/// Completion of one resource operation. Reads deliver the whole resource;
/// every other operation delivers an empty buffer.
pub type ResourceCallback = Box<dyn FnOnce(&mut Xively, ResourceHandle, Bytes, State)>;

/// One resource being worked on.
pub struct ResourceManagerContext {
    name: String,
    flags: OpenFlags,
    file: Option<FsHandle>,
    size: usize,
    offset: usize,
    buffer: BytesMut,
    busy: bool,
}

impl ResourceManagerContext {
    fn new(name: &str, flags: OpenFlags) -> Self {
        Self {
            name: name.to_string(),
            flags,
            file: None,
            size: 0,
            offset: 0,
            buffer: BytesMut::new(),
            busy: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// Claim the context for one operation.
fn begin(xi: &mut Xively, handle: ResourceHandle, needs_file: bool) -> Result<()> {
    let context = xi.resources.get_mut(handle.0).ok_or(State::InvalidParameter)?;
    if context.busy || (needs_file && context.file.is_none()) {
        return Err(State::InvalidParameter);
    }
    context.busy = true;
    Ok(())
}

fn finish(xi: &mut Xively, handle: ResourceHandle, callback: ResourceCallback, data: Bytes, state: State) -> State {
    if let Some(context) = xi.resources.get_mut(handle.0) {
        context.busy = false;
    }
    callback(xi, handle, data, state);
    State::Ok
}

/// Stat and open `name`. Opening for writing creates a missing resource.
pub fn open(xi: &mut Xively, name: &str, flags: OpenFlags, callback: ResourceCallback) -> Result<ResourceHandle> {
    if name.is_empty() || !(flags.read || flags.write) {
        return Err(State::InvalidParameter);
    }
    let mut context = ResourceManagerContext::new(name, flags);
    context.busy = true;
    let handle = ResourceHandle(xi.resources.insert(context)?);
    let scheduled = xi
        .dispatcher
        .execute(Box::new(move |xi: &mut Xively| do_open(xi, handle, callback)));
    if let Err(err) = scheduled {
        xi.resources.remove(handle.0);
        return Err(err);
    }
    Ok(handle)
}

fn do_open(xi: &mut Xively, handle: ResourceHandle, callback: ResourceCallback) -> State {
    let Some(context) = xi.resources.get(handle.0) else {
        return State::Ok;
    };
    let (name, flags) = (context.name.clone(), context.flags);
    let size = match xi.fs.stat(&name) {
        Ok(stat) => stat.size,
        Err(State::FsResourceNotAvailable) if flags.write => 0,
        Err(err) => {
            debug!("resource {} not available: {}", name, err);
            return finish(xi, handle, callback, Bytes::new(), err);
        }
    };
    let state = match xi.fs.open(&name, flags) {
        Ok(file) => {
            if let Some(context) = xi.resources.get_mut(handle.0) {
                context.file = Some(file);
                context.size = if flags.write { 0 } else { size };
            }
            trace!("resource {} opened ({} bytes)", name, size);
            State::Ok
        }
        Err(err) => {
            error!("could not open resource {}: {}", name, err);
            err
        }
    };
    finish(xi, handle, callback, Bytes::new(), state)
}

/// Read the whole resource.
pub fn read(xi: &mut Xively, handle: ResourceHandle, callback: ResourceCallback) -> Result<()> {
    begin(xi, handle, true)?;
    if let Some(context) = xi.resources.get_mut(handle.0) {
        context.offset = 0;
        context.buffer.clear();
    }
    schedule(xi, handle, Box::new(move |xi: &mut Xively| read_chunk(xi, handle, callback)))
}

fn read_chunk(xi: &mut Xively, handle: ResourceHandle, callback: ResourceCallback) -> State {
    let Some(context) = xi.resources.get(handle.0) else {
        return State::Ok;
    };
    let Some(file) = context.file else {
        return finish(xi, handle, callback, Bytes::new(), State::FsReadError);
    };
    let (offset, size) = (context.offset, context.size);
    let want = size.saturating_sub(offset).min(READ_CHUNK_SIZE);

    let chunk = match xi.fs.read(file, offset, want) {
        Ok(chunk) => chunk,
        Err(err) => {
            error!("reading resource failed at offset {}: {}", offset, err);
            return finish(xi, handle, callback, Bytes::new(), State::FsReadError);
        }
    };
    let Some(context) = xi.resources.get_mut(handle.0) else {
        return State::Ok;
    };
    context.buffer.extend_from_slice(&chunk);
    context.offset += chunk.len();

    if chunk.is_empty() || context.offset >= context.size {
        let data = context.buffer.split().freeze();
        return finish(xi, handle, callback, data, State::Ok);
    }
    let next = xi
        .dispatcher
        .execute(Box::new(move |xi: &mut Xively| read_chunk(xi, handle, callback)));
    match next {
        Ok(_) => State::Ok,
        Err(err) => err,
    }
}

/// Append `data` at the current write position.
pub fn write(xi: &mut Xively, handle: ResourceHandle, data: Bytes, callback: ResourceCallback) -> Result<()> {
    begin(xi, handle, true)?;
    schedule(
        xi,
        handle,
        Box::new(move |xi: &mut Xively| {
            let Some(context) = xi.resources.get(handle.0) else {
                return State::Ok;
            };
            let (file, offset) = match context.file {
                Some(file) => (file, context.offset),
                None => return finish(xi, handle, callback, Bytes::new(), State::FsWriteError),
            };
            let state = match xi.fs.write(file, offset, &data) {
                Ok(written) => {
                    if let Some(context) = xi.resources.get_mut(handle.0) {
                        context.offset += written;
                        context.size = context.size.max(context.offset);
                    }
                    State::Ok
                }
                Err(err) => {
                    error!("writing resource failed: {}", err);
                    State::FsWriteError
                }
            };
            finish(xi, handle, callback, Bytes::new(), state)
        }),
    )
}

/// Close the resource and release its context. The handle is invalid once
/// the callback runs.
pub fn close(xi: &mut Xively, handle: ResourceHandle, callback: ResourceCallback) -> Result<()> {
    begin(xi, handle, false)?;
    schedule(
        xi,
        handle,
        Box::new(move |xi: &mut Xively| {
            let Some(context) = xi.resources.remove(handle.0) else {
                return State::Ok;
            };
            let state = match context.file {
                Some(file) => match xi.fs.close(file) {
                    Ok(()) => State::Ok,
                    Err(_) => State::FsCloseError,
                },
                None => State::Ok,
            };
            callback(xi, handle, Bytes::new(), state);
            State::Ok
        }),
    )
}

fn schedule(xi: &mut Xively, handle: ResourceHandle, work: crate::dispatcher::Handle<Xively>) -> Result<()> {
    match xi.dispatcher.execute(work) {
        Ok(_) => Ok(()),
        Err(err) => {
            if let Some(context) = xi.resources.get_mut(handle.0) {
                context.busy = false;
            }
            Err(err)
        }
    }
}
