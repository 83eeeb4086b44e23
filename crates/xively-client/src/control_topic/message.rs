//! Control messages of the file transfer protocol.
//!
//! Messages are CBOR maps keyed by short strings. Encoding goes through
//! `serde` structs so keys come out in declaration order; decoding walks a
//! generic `serde_cbor::Value` and ignores anything it does not know.

use std::collections::BTreeMap;

use bytes::Bytes;
use log::{debug, warn};
use serde::{Serialize, Serializer};
use serde_cbor::Value;

use crate::state::{Result, State};

/// Protocol version this client speaks.
pub const MESSAGE_VERSION: u32 = 1;

/// Revision reported for files that have no stored revision.
pub const GENERATED_REVISION: &str =
    "revision is not available on the device, this is a generated revision 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    FileInfo = 0,
    FileUpdateAvailable = 1,
    FileGetChunk = 2,
    FileChunk = 3,
    FileStatus = 4,
}

impl MessageType {
    fn from_code(code: i128) -> Option<Self> {
        match code {
            0 => Some(MessageType::FileInfo),
            1 => Some(MessageType::FileUpdateAvailable),
            2 => Some(MessageType::FileGetChunk),
            3 => Some(MessageType::FileChunk),
            4 => Some(MessageType::FileStatus),
            _ => None,
        }
    }
}

/// Phase reported in FILE_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusPhase {
    Downloading = 1,
    Downloaded = 2,
    Processing = 3,
    Finished = 4,
}

/// Result reported in FILE_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum StatusCode {
    Success = 0,
    FileOpenError = -100,
    FileWriteError = -101,
    ChecksumMismatch = -102,
    UrlDownloadError = -103,
}

/// A file and the revision the device holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDesc {
    pub name: String,
    pub revision: String,
}

/// A file offered for download.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileDescExt {
    pub name: String,
    pub revision: String,
    pub operation: u8,
    pub size: u32,
    pub fingerprint: Vec<u8>,
    pub download_link: Option<String>,
    /// Chunked MQTT download remains possible alongside the link.
    pub mqtt_download_also_supported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    FileInfo {
        list: Vec<FileDesc>,
        accept_download_link: bool,
    },
    FileUpdateAvailable {
        msgver: u32,
        list: Vec<FileDescExt>,
    },
    FileGetChunk {
        name: String,
        revision: String,
        offset: u32,
        length: u32,
    },
    FileChunk {
        msgver: u32,
        name: String,
        revision: String,
        offset: u32,
        length: u32,
        status: u8,
        chunk: Bytes,
    },
    FileStatus {
        name: String,
        revision: String,
        phase: StatusPhase,
        code: StatusCode,
    },
}

struct ByteBuf<'a>(&'a [u8]);

impl Serialize for ByteBuf<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

#[derive(Serialize)]
struct NameRevision<'a> {
    #[serde(rename = "N")]
    name: &'a str,
    #[serde(rename = "R")]
    revision: &'a str,
}

#[derive(Serialize)]
struct FileInfoWire<'a> {
    msgtype: u8,
    msgver: u32,
    list: Vec<NameRevision<'a>>,
    #[serde(rename = "L", skip_serializing_if = "Option::is_none")]
    accept_download_link: Option<bool>,
}

#[derive(Serialize)]
struct FileDescExtWire<'a> {
    #[serde(rename = "N")]
    name: &'a str,
    #[serde(rename = "R")]
    revision: &'a str,
    #[serde(rename = "O")]
    operation: u8,
    #[serde(rename = "S")]
    size: u32,
    #[serde(rename = "F")]
    fingerprint: ByteBuf<'a>,
    #[serde(rename = "U", skip_serializing_if = "Option::is_none")]
    download_link: Option<&'a str>,
    #[serde(rename = "D", skip_serializing_if = "Option::is_none")]
    mqtt_download_also_supported: Option<bool>,
}

#[derive(Serialize)]
struct FileUpdateAvailableWire<'a> {
    msgtype: u8,
    msgver: u32,
    list: Vec<FileDescExtWire<'a>>,
}

#[derive(Serialize)]
struct FileGetChunkWire<'a> {
    msgtype: u8,
    msgver: u32,
    #[serde(rename = "N")]
    name: &'a str,
    #[serde(rename = "R")]
    revision: &'a str,
    #[serde(rename = "O")]
    offset: u32,
    #[serde(rename = "L")]
    length: u32,
}

#[derive(Serialize)]
struct FileChunkWire<'a> {
    msgtype: u8,
    msgver: u32,
    #[serde(rename = "N")]
    name: &'a str,
    #[serde(rename = "R")]
    revision: &'a str,
    #[serde(rename = "O")]
    offset: u32,
    #[serde(rename = "L")]
    length: u32,
    #[serde(rename = "S")]
    status: u8,
    #[serde(rename = "C")]
    chunk: ByteBuf<'a>,
}

#[derive(Serialize)]
struct FileStatusWire<'a> {
    msgtype: u8,
    msgver: u32,
    #[serde(rename = "N")]
    name: &'a str,
    #[serde(rename = "R")]
    revision: &'a str,
    #[serde(rename = "P")]
    phase: u8,
    #[serde(rename = "S")]
    code: i8,
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(|err| {
        warn!("control message encoding failed: {}", err);
        State::SerializationError
    })
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::FileInfo { .. } => MessageType::FileInfo,
            ControlMessage::FileUpdateAvailable { .. } => MessageType::FileUpdateAvailable,
            ControlMessage::FileGetChunk { .. } => MessageType::FileGetChunk,
            ControlMessage::FileChunk { .. } => MessageType::FileChunk,
            ControlMessage::FileStatus { .. } => MessageType::FileStatus,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let msgtype = self.message_type() as u8;
        match self {
            ControlMessage::FileInfo {
                list,
                accept_download_link,
            } => to_cbor(&FileInfoWire {
                msgtype,
                msgver: MESSAGE_VERSION,
                list: list
                    .iter()
                    .map(|file| NameRevision {
                        name: &file.name,
                        revision: &file.revision,
                    })
                    .collect(),
                accept_download_link: accept_download_link.then_some(true),
            }),
            ControlMessage::FileUpdateAvailable { msgver, list } => to_cbor(&FileUpdateAvailableWire {
                msgtype,
                msgver: *msgver,
                list: list
                    .iter()
                    .map(|file| FileDescExtWire {
                        name: &file.name,
                        revision: &file.revision,
                        operation: file.operation,
                        size: file.size,
                        fingerprint: ByteBuf(&file.fingerprint),
                        download_link: file.download_link.as_deref(),
                        mqtt_download_also_supported: file.mqtt_download_also_supported.then_some(true),
                    })
                    .collect(),
            }),
            ControlMessage::FileGetChunk {
                name,
                revision,
                offset,
                length,
            } => to_cbor(&FileGetChunkWire {
                msgtype,
                msgver: MESSAGE_VERSION,
                name,
                revision,
                offset: *offset,
                length: *length,
            }),
            ControlMessage::FileChunk {
                msgver,
                name,
                revision,
                offset,
                length,
                status,
                chunk,
            } => to_cbor(&FileChunkWire {
                msgtype,
                msgver: *msgver,
                name,
                revision,
                offset: *offset,
                length: *length,
                status: *status,
                chunk: ByteBuf(chunk),
            }),
            ControlMessage::FileStatus {
                name,
                revision,
                phase,
                code,
            } => to_cbor(&FileStatusWire {
                msgtype,
                msgver: MESSAGE_VERSION,
                name,
                revision,
                phase: *phase as u8,
                code: *code as i8,
            }),
        }
    }

    /// Decode a control message. Anything without a known `msgtype` is
    /// `None`.
    pub fn decode(data: &[u8]) -> Option<ControlMessage> {
        let value: Value = match serde_cbor::from_slice(data) {
            Ok(value) => value,
            Err(err) => {
                debug!("control message is not CBOR: {}", err);
                return None;
            }
        };
        let Value::Map(map) = value else {
            debug!("control message is not a map");
            return None;
        };
        let msgtype = int(&map, "msgtype").and_then(MessageType::from_code)?;
        let msgver = int(&map, "msgver").and_then(|v| u32::try_from(v).ok()).unwrap_or(MESSAGE_VERSION);

        let message = match msgtype {
            MessageType::FileInfo => ControlMessage::FileInfo {
                list: list(&map)
                    .iter()
                    .filter_map(|entry| match entry {
                        Value::Map(file) => Some(FileDesc {
                            name: text(file, "N")?,
                            revision: text(file, "R").unwrap_or_default(),
                        }),
                        _ => None,
                    })
                    .collect(),
                accept_download_link: flag(&map, "L"),
            },
            MessageType::FileUpdateAvailable => ControlMessage::FileUpdateAvailable {
                msgver,
                list: list(&map)
                    .iter()
                    .filter_map(|entry| match entry {
                        Value::Map(file) => Some(FileDescExt {
                            name: text(file, "N")?,
                            revision: text(file, "R").unwrap_or_default(),
                            operation: uint(file, "O").unwrap_or(0) as u8,
                            size: uint(file, "S").unwrap_or(0),
                            fingerprint: bytes(file, "F").unwrap_or_default(),
                            download_link: text(file, "U"),
                            mqtt_download_also_supported: flag(file, "D"),
                        }),
                        _ => None,
                    })
                    .collect(),
            },
            MessageType::FileGetChunk => ControlMessage::FileGetChunk {
                name: text(&map, "N")?,
                revision: text(&map, "R").unwrap_or_default(),
                offset: uint(&map, "O").unwrap_or(0),
                length: uint(&map, "L").unwrap_or(0),
            },
            MessageType::FileChunk => {
                let chunk = bytes(&map, "C").unwrap_or_default();
                ControlMessage::FileChunk {
                    msgver,
                    name: text(&map, "N")?,
                    revision: text(&map, "R").unwrap_or_default(),
                    offset: uint(&map, "O").unwrap_or(0),
                    length: uint(&map, "L").unwrap_or(chunk.len() as u32),
                    status: uint(&map, "S").unwrap_or(0) as u8,
                    chunk: Bytes::from(chunk),
                }
            }
            MessageType::FileStatus => ControlMessage::FileStatus {
                name: text(&map, "N")?,
                revision: text(&map, "R").unwrap_or_default(),
                phase: match int(&map, "P")? {
                    1 => StatusPhase::Downloading,
                    2 => StatusPhase::Downloaded,
                    3 => StatusPhase::Processing,
                    _ => StatusPhase::Finished,
                },
                code: match int(&map, "S")? {
                    0 => StatusCode::Success,
                    -100 => StatusCode::FileOpenError,
                    -101 => StatusCode::FileWriteError,
                    -102 => StatusCode::ChecksumMismatch,
                    _ => StatusCode::UrlDownloadError,
                },
            },
        };
        Some(message)
    }
}

fn get<'a>(map: &'a BTreeMap<Value, Value>, key: &str) -> Option<&'a Value> {
    map.get(&Value::Text(key.to_string()))
}

fn int(map: &BTreeMap<Value, Value>, key: &str) -> Option<i128> {
    match get(map, key)? {
        Value::Integer(value) => Some(*value),
        _ => None,
    }
}

fn uint(map: &BTreeMap<Value, Value>, key: &str) -> Option<u32> {
    int(map, key).and_then(|value| u32::try_from(value).ok())
}

fn text(map: &BTreeMap<Value, Value>, key: &str) -> Option<String> {
    match get(map, key)? {
        Value::Text(value) => Some(value.clone()),
        _ => None,
    }
}

fn bytes(map: &BTreeMap<Value, Value>, key: &str) -> Option<Vec<u8>> {
    match get(map, key)? {
        Value::Bytes(value) => Some(value.clone()),
        _ => None,
    }
}

fn flag(map: &BTreeMap<Value, Value>, key: &str) -> bool {
    match get(map, key) {
        Some(Value::Bool(value)) => *value,
        Some(Value::Integer(value)) => *value != 0,
        _ => false,
    }
}

fn list(map: &BTreeMap<Value, Value>) -> &[Value] {
    match get(map, "list") {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}
