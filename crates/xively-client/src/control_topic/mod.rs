//! The control channel between a device and the Xively services.

mod message;

pub use message::{
    ControlMessage, FileDesc, FileDescExt, MessageType, StatusCode, StatusPhase, GENERATED_REVISION,
    MESSAGE_VERSION,
};

use crate::state::{Result, State};

/// Topic pair of one device's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTopics {
    /// Device to service, `xi/ctrl/v1/<device>/svc`.
    pub publish: String,
    /// Service to device, `xi/ctrl/v1/<device>/cln`.
    pub subscribe: String,
}

impl ControlTopics {
    pub fn new(device_id: &str) -> Result<Self> {
        if device_id.is_empty() {
            return Err(State::InvalidParameter);
        }
        Ok(Self {
            publish: format!("xi/ctrl/v1/{}/svc", device_id),
            subscribe: format!("xi/ctrl/v1/{}/cln", device_id),
        })
    }
}
