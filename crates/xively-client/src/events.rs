//! Callback types handed to the public API.

use bytes::Bytes;
use xively_core::{QoS, SubackStatus};

use crate::client::Xively;
use crate::connection::ConnectionData;
use crate::context::ContextHandle;
use crate::state::State;

/// Connection lifecycle notifications: opened, closed or failed to open.
/// The state is the cause; [`State::Ok`] for a successful open or a
/// requested shutdown.
pub type ConnectionCallback = Box<dyn FnMut(&mut Xively, ContextHandle, &ConnectionData, State)>;

/// Delivery outcome of one publish. QoS 0 completes once written, QoS 1 on
/// PUBACK and QoS 2 on PUBCOMP.
pub type PublishCallback = Box<dyn FnOnce(&mut Xively, ContextHandle, State)>;

/// Subscription acknowledgment and every message received on it.
pub type SubscriptionCallback = Box<dyn FnMut(&mut Xively, ContextHandle, SubscriptionData<'_>, State)>;

/// What a subscription callback is being told about.
#[derive(Debug)]
pub enum SubscriptionData<'a> {
    /// The broker answered the SUBSCRIBE. State is
    /// [`State::MqttSubscriptionSuccessful`] or
    /// [`State::MqttSubscriptionFailed`].
    Suback {
        topic: &'a str,
        status: SubackStatus,
    },
    /// A message arrived on a matching topic.
    Message {
        topic: &'a str,
        payload: &'a Bytes,
        qos: QoS,
        retain: bool,
        dup: bool,
    },
}

impl SubscriptionData<'_> {
    pub fn topic(&self) -> &str {
        match self {
            SubscriptionData::Suback { topic, .. } | SubscriptionData::Message { topic, .. } => topic,
        }
    }
}
