//! Limits configuration.

use serde::Deserialize;
use xively_core::MAX_PAYLOAD_SIZE;

/// Default maximum number of publishes awaiting completion per context.
pub const DEFAULT_MAX_PUBS_IN_FLIGHT: usize = 16;

/// Default number of retransmissions before a QoS 1/2 publish fails.
pub const DEFAULT_MAX_PUBLISH_RETRIES: u32 = 3;

/// Default number of timed task slots.
pub const DEFAULT_MAX_TIMED_TASKS: usize = 64;

/// Default number of context slots.
pub const DEFAULT_MAX_CONTEXTS: usize = 16;

/// Default number of pending dispatcher events.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Default largest inbound packet accepted (payload ceiling plus headers).
pub const DEFAULT_MAX_PACKET_SIZE: usize = MAX_PAYLOAD_SIZE + 1024;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Publishes awaiting acknowledgment (or write completion for QoS 0).
    pub max_pubs_in_flight: usize,
    /// Largest outbound PUBLISH payload. Never above the codec ceiling.
    pub max_payload_size: usize,
    /// Retransmissions of an unacknowledged QoS 1/2 message.
    pub max_publish_retries: u32,
    /// Timed task slots.
    pub max_timed_tasks: usize,
    /// Context handle slots.
    pub max_contexts: usize,
    /// Pending dispatcher events.
    pub max_events: usize,
    /// Largest inbound packet.
    pub max_packet_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pubs_in_flight: DEFAULT_MAX_PUBS_IN_FLIGHT,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_publish_retries: DEFAULT_MAX_PUBLISH_RETRIES,
            max_timed_tasks: DEFAULT_MAX_TIMED_TASKS,
            max_contexts: DEFAULT_MAX_CONTEXTS,
            max_events: DEFAULT_MAX_EVENTS,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl LimitsConfig {
    /// Validate the limits configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_payload_size > MAX_PAYLOAD_SIZE {
            return Err(format!(
                "limits.max_payload_size ({}) exceeds codec maximum ({})",
                self.max_payload_size, MAX_PAYLOAD_SIZE
            ));
        }
        if self.max_pubs_in_flight == 0 {
            return Err("limits.max_pubs_in_flight must be at least 1".into());
        }
        if self.max_contexts == 0 || self.max_timed_tasks == 0 || self.max_events == 0 {
            return Err("limits.max_contexts, max_timed_tasks and max_events must be non-zero".into());
        }
        Ok(())
    }
}
