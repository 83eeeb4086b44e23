//! Secure file transfer over the control topic.
//!
//! On every connection the device subscribes to its control topic and
//! reports the revisions of its updateable files with FILE_INFO. The
//! service answers with FILE_UPDATE_AVAILABLE when something is newer;
//! the files are then fetched one after another, either chunk by chunk
//! over MQTT or by the application through a download link, checked
//! against their SHA-256 fingerprint and reported with FILE_STATUS.
//!
//! Every entry point accepts a context without file transfer state, or a
//! message it cannot make sense of, and does nothing.

mod download;
pub mod revision;

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use xively_core::QoS;

use crate::client::Xively;
use crate::control_topic::{ControlMessage, ControlTopics, FileDesc, FileDescExt, StatusCode, StatusPhase};
use crate::context::ContextHandle;
use crate::events::SubscriptionData;
use crate::fs::OpenFlags;
use crate::state::Result;

use download::ChunkDownload;
pub use download::{download_order, UpdatePackage};

/// Name of the firmware image unless [`FirmwareHooks::is_firmware`] says
/// otherwise.
pub const FIRMWARE_FILE_NAME: &str = "firmware.bin";

/// Downloads files through a link the service offers, outside of MQTT.
pub trait UrlHandler {
    /// Start downloading `url` into the resource `file_name` and return
    /// whether the download was taken. The application reports the end
    /// through [`Xively::sft_file_downloaded`]. Returning false falls back
    /// to the MQTT download when the service allows it.
    fn start_download(&mut self, url: &str, file_name: &str) -> bool;
}

/// Application hooks around firmware updates.
pub trait FirmwareHooks {
    fn is_firmware(&self, name: &str) -> bool {
        name == FIRMWARE_FILE_NAME
    }

    /// A file of the package was stored and verified.
    fn on_file_downloaded(&mut self, _name: &str) {}

    /// Every file of the package was handled. `firmware` names the image
    /// to install, if the package carried one.
    fn on_package_finished(&mut self, _firmware: Option<&str>) {}
}

/// Hooks that only tell firmware apart by name.
#[derive(Debug, Default)]
pub struct DefaultFirmwareHooks;

impl FirmwareHooks for DefaultFirmwareHooks {}

/// Application collaborators of the file transfer.
pub(crate) struct SftHooks {
    pub url_handler: Option<Box<dyn UrlHandler>>,
    pub firmware: Box<dyn FirmwareHooks>,
}

impl Default for SftHooks {
    fn default() -> Self {
        Self {
            url_handler: None,
            firmware: Box::new(DefaultFirmwareHooks),
        }
    }
}

/// File transfer state of one context.
pub struct SftContext {
    topics: ControlTopics,
    package: Option<UpdatePackage>,
}

impl SftContext {
    pub fn new(topics: ControlTopics) -> Self {
        Self { topics, package: None }
    }

    pub fn topics(&self) -> &ControlTopics {
        &self.topics
    }

    /// The package being downloaded.
    pub fn package(&self) -> Option<&UpdatePackage> {
        self.package.as_ref()
    }

    pub fn current_file(&self) -> Option<&FileDescExt> {
        self.package.as_ref().and_then(UpdatePackage::current_file)
    }

    /// Move to the next file of the package. Without a package there is
    /// nothing to select.
    pub fn select_next_resource_to_download(&mut self) -> Result<()> {
        match self.package.as_mut() {
            Some(package) => package.select_next_resource_to_download(),
            None => Ok(()),
        }
    }
}

/// Run `f` on the detached file transfer state of `handle`.
fn with_sft(xi: &mut Xively, handle: ContextHandle, f: impl FnOnce(&mut Xively, &mut SftContext)) {
    let Some(mut sft) = xi.contexts.get_mut(handle.0).and_then(|context| context.sft.take()) else {
        trace!("context {} has no file transfer state", handle.0);
        return;
    };
    f(xi, &mut sft);
    if let Some(context) = xi.contexts.get_mut(handle.0) {
        if context.sft.is_none() {
            context.sft = Some(sft);
        }
    }
}

/// The connection is up: subscribe to the control topic and report the
/// updateable files.
pub fn on_connected(xi: &mut Xively, handle: ContextHandle) {
    if !xi.config.sft.enabled {
        return;
    }
    let topics = match ControlTopics::new(xi.device_id()) {
        Ok(topics) => topics,
        Err(err) => {
            warn!("no control topic for this device: {}", err);
            return;
        }
    };
    let Some(context) = xi.contexts.get_mut(handle.0) else {
        return;
    };
    if context.sft.is_none() {
        context.sft = Some(SftContext::new(topics.clone()));
    }
    let subscribed = context
        .session
        .handlers
        .iter()
        .any(|handler| handler.filter == topics.subscribe)
        || context.session.subscriptions.iter().any(|sub| sub.topic == topics.subscribe);

    if !subscribed {
        let subscription = xi.subscribe(
            handle,
            &topics.subscribe,
            QoS::AtLeastOnce,
            Box::new(|xi: &mut Xively, handle, data, _state| {
                if let SubscriptionData::Message { payload, .. } = data {
                    on_message(xi, handle, payload);
                }
            }),
        );
        if let Err(err) = subscription {
            warn!("could not subscribe to {}: {}", topics.subscribe, err);
        }
    }

    let updateable = xi.config.sft.updateable_files.clone();
    let list = updateable
        .into_iter()
        .map(|name| {
            let revision = revision::reported(xi.filesystem(), &name);
            FileDesc { name, revision }
        })
        .collect();
    let message = ControlMessage::FileInfo {
        list,
        accept_download_link: xi.config.sft.accept_download_link,
    };
    send(xi, handle, &topics, &message);
}

/// The connection is gone: drop the package in progress. The service
/// offers it again after the next FILE_INFO.
pub fn on_connection_failed(xi: &mut Xively, handle: ContextHandle) {
    with_sft(xi, handle, |xi, sft| {
        if sft.package.is_some() {
            debug!("file transfer interrupted");
        }
        abort_package(xi, sft);
    });
}

/// A message arrived on the control topic.
pub fn on_message(xi: &mut Xively, handle: ContextHandle, payload: &[u8]) {
    let Some(message) = ControlMessage::decode(payload) else {
        debug!("undecodable control message of {} bytes dropped", payload.len());
        return;
    };
    trace!("control message {:?}", message.message_type());
    with_sft(xi, handle, |xi, sft| match message {
        ControlMessage::FileUpdateAvailable { list, .. } => on_update_available(xi, handle, sft, list),
        ControlMessage::FileChunk {
            name,
            offset,
            status,
            chunk,
            ..
        } => on_chunk(xi, handle, sft, &name, offset, status, chunk),
        other => debug!("{:?} is not meant for devices", other.message_type()),
    });
}

/// The application finished a download started through the
/// [`UrlHandler`].
pub fn on_file_downloaded(xi: &mut Xively, handle: ContextHandle, name: &str, success: bool) {
    with_sft(xi, handle, |xi, sft| {
        let Some(file) = sft.current_file().cloned() else {
            warn!("download of {} finished with no file transfer running", name);
            return;
        };
        if file.name != name {
            warn!("download of {} finished while {} is current", name, file.name);
            return;
        }
        if success {
            info!("{} downloaded through its link", name);
            file_done(xi, handle, sft);
            return;
        }
        warn!("link download of {} failed", name);
        send_status(xi, handle, &sft.topics, &file, StatusPhase::Downloading, StatusCode::UrlDownloadError);
        if file.mqtt_download_also_supported {
            start_chunk_download(xi, handle, sft);
        } else {
            continue_package(xi, handle, sft);
        }
    });
}

fn send(xi: &mut Xively, handle: ContextHandle, topics: &ControlTopics, message: &ControlMessage) {
    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(err) => {
            error!("could not encode {:?}: {}", message.message_type(), err);
            return;
        }
    };
    let published = xi.publish(
        handle,
        &topics.publish,
        Bytes::from(payload),
        QoS::AtLeastOnce,
        false,
        None,
    );
    if let Err(err) = published {
        warn!("could not send {:?}: {}", message.message_type(), err);
    }
}

fn send_status(
    xi: &mut Xively,
    handle: ContextHandle,
    topics: &ControlTopics,
    file: &FileDescExt,
    phase: StatusPhase,
    code: StatusCode,
) {
    debug!("{} status {:?}/{:?}", file.name, phase, code);
    let message = ControlMessage::FileStatus {
        name: file.name.clone(),
        revision: file.revision.clone(),
        phase,
        code,
    };
    send(xi, handle, topics, &message);
}

fn request_chunk(xi: &mut Xively, handle: ContextHandle, topics: &ControlTopics, file: &FileDescExt, offset: u32) {
    let length = xi.config.sft.chunk_size.min(file.size.saturating_sub(offset));
    let message = ControlMessage::FileGetChunk {
        name: file.name.clone(),
        revision: file.revision.clone(),
        offset,
        length,
    };
    send(xi, handle, topics, &message);
}

/// Close whatever the package has open and forget it.
fn abort_package(xi: &mut Xively, sft: &mut SftContext) {
    if let Some(package) = sft.package.as_mut() {
        close_download(xi, package);
    }
    sft.package = None;
}

fn close_download(xi: &mut Xively, package: &mut UpdatePackage) -> Option<ChunkDownload> {
    let mut download = package.download.take()?;
    if let Some(file) = download.file.take() {
        if let Err(err) = xi.filesystem().close(file) {
            warn!("closing downloaded file failed: {}", err);
        }
    }
    Some(download)
}

fn on_update_available(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext, files: Vec<FileDescExt>) {
    abort_package(xi, sft);
    if files.is_empty() {
        debug!("update offered with no files");
        return;
    }
    info!("update of {} file(s) available", files.len());
    let order = {
        let firmware = &xi.sft_hooks.firmware;
        download_order(&files, &xi.config.sft.updateable_files, |name| firmware.is_firmware(name))
    };
    sft.package = Some(UpdatePackage::new(files, Some(order)));
    continue_package(xi, handle, sft);
}

/// Start on the next file, or wrap the package up when none is left.
fn continue_package(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext) {
    let Some(package) = sft.package.as_mut() else {
        return;
    };
    if let Err(err) = package.select_next_resource_to_download() {
        warn!("file transfer in an invalid state: {}", err);
        return;
    }
    if package.current.is_some() {
        download_current(xi, handle, sft);
        return;
    }

    let firmware = package.firmware_file().cloned();
    if let Some(firmware) = &firmware {
        send_status(xi, handle, &sft.topics, firmware, StatusPhase::Processing, StatusCode::Success);
    }
    info!("package download finished");
    xi.sft_hooks
        .firmware
        .on_package_finished(firmware.as_ref().map(|file| file.name.as_str()));
    sft.package = None;
}

fn download_current(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext) {
    let Some(package) = sft.package.as_mut() else {
        return;
    };
    let Some((index, file)) = package
        .current
        .and_then(|index| Some((index, package.files.get(index)?.clone())))
    else {
        return;
    };
    if xi.sft_hooks.firmware.is_firmware(&file.name) {
        package.firmware = Some(index);
    }

    let accept_link = xi.config.sft.accept_download_link;
    let by_link = match (&file.download_link, xi.sft_hooks.url_handler.as_mut()) {
        (Some(url), Some(handler)) if accept_link => handler.start_download(url, &file.name),
        _ => false,
    };
    if by_link {
        debug!("{} is downloaded by the application", file.name);
        send_status(xi, handle, &sft.topics, &file, StatusPhase::Downloading, StatusCode::Success);
    } else if file.download_link.is_none() || file.mqtt_download_also_supported {
        start_chunk_download(xi, handle, sft);
    } else {
        warn!("{} is only offered through a link nobody handles", file.name);
        continue_package(xi, handle, sft);
    }
}

fn start_chunk_download(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext) {
    let Some(file) = sft.current_file().cloned() else {
        return;
    };
    if let Some(package) = sft.package.as_mut() {
        close_download(xi, package);
        package.download = Some(ChunkDownload::new());
    }
    debug!("downloading {} ({} bytes)", file.name, file.size);
    request_chunk(xi, handle, &sft.topics, &file, 0);
}

/// The current file could not be downloaded: report it and move on.
fn fail_current(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext, phase: StatusPhase, code: StatusCode) {
    let Some(package) = sft.package.as_mut() else {
        return;
    };
    close_download(xi, package);
    if let Some(file) = package.current_file().cloned() {
        error!("download of {} failed: {:?}", file.name, code);
        send_status(xi, handle, &sft.topics, &file, phase, code);
    }
    continue_package(xi, handle, sft);
}

fn on_chunk(
    xi: &mut Xively,
    handle: ContextHandle,
    sft: &mut SftContext,
    name: &str,
    offset: u32,
    status: u8,
    chunk: Bytes,
) {
    let Some(package) = sft.package.as_mut() else {
        debug!("chunk of {} with no download running", name);
        return;
    };
    let Some(file) = package.current_file().cloned() else {
        return;
    };
    let Some(download) = package.download.as_mut() else {
        debug!("chunk of {} while it is not downloaded over MQTT", name);
        return;
    };
    if file.name != name || download.offset != offset {
        debug!("unexpected chunk of {} at {} dropped", name, offset);
        return;
    }
    if status != 0 {
        warn!("service could not serve {} (status {})", name, status);
        close_download(xi, package);
        continue_package(xi, handle, sft);
        return;
    }
    if chunk.is_empty() && offset < file.size {
        return fail_current(xi, handle, sft, StatusPhase::Downloading, StatusCode::FileWriteError);
    }

    let file_handle = match download.file {
        Some(file_handle) => file_handle,
        None => match xi.filesystem().open(&file.name, OpenFlags::WRITE) {
            Ok(file_handle) => {
                download.file = Some(file_handle);
                file_handle
            }
            Err(err) => {
                error!("could not open {} for writing: {}", file.name, err);
                return fail_current(xi, handle, sft, StatusPhase::Downloading, StatusCode::FileOpenError);
            }
        },
    };
    if let Err(err) = xi.filesystem().write(file_handle, offset as usize, &chunk) {
        error!("could not write {} at {}: {}", file.name, offset, err);
        return fail_current(xi, handle, sft, StatusPhase::Downloading, StatusCode::FileWriteError);
    }
    download.update(&chunk);
    let received = download.offset;
    trace!("{}: {}/{} bytes", file.name, received, file.size);

    if received < file.size {
        request_chunk(xi, handle, &sft.topics, &file, received);
        return;
    }

    let Some(download) = close_download(xi, package) else {
        return;
    };
    if !download.verify(&file.fingerprint) {
        return fail_current(xi, handle, sft, StatusPhase::Downloaded, StatusCode::ChecksumMismatch);
    }
    info!("{} downloaded and verified", file.name);
    file_done(xi, handle, sft);
}

/// The current file is stored: record its revision and go on.
fn file_done(xi: &mut Xively, handle: ContextHandle, sft: &mut SftContext) {
    let Some(package) = sft.package.as_ref() else {
        return;
    };
    let Some(file) = package.current_file().cloned() else {
        return;
    };
    let is_firmware = package.firmware.is_some() && package.firmware == package.current;
    xi.sft_hooks.firmware.on_file_downloaded(&file.name);

    let stored = if is_firmware {
        revision::set_pending(xi.filesystem(), &file.name, &file.revision)
    } else {
        send_status(xi, handle, &sft.topics, &file, StatusPhase::Finished, StatusCode::Success);
        revision::set(xi.filesystem(), &file.name, &file.revision)
    };
    if let Err(err) = stored {
        warn!("could not store revision of {}: {}", file.name, err);
    }
    continue_package(xi, handle, sft);
}
