//! Connection configuration.

use serde::Deserialize;

use crate::connection::SessionType;

/// Default broker host.
pub const DEFAULT_HOST: &str = "broker.xively.com";

/// Default broker port (MQTT over TLS).
pub const DEFAULT_PORT: u16 = 8883;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_TIMEOUT: u16 = 10;

/// Default connection timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT: u32 = 10;

/// Default upper bound on a single blocking poll, in milliseconds.
pub const DEFAULT_NETWORK_TIMEOUT_MS: u32 = 1500;

/// Connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT keepalive interval in seconds; also the PINGRESP grace window
    /// and the QoS 1/2 retransmission interval.
    pub keepalive_timeout: u16,
    /// Seconds allowed from socket open to CONNACK.
    pub connection_timeout: u32,
    /// Clean or continued session.
    pub session: SessionType,
    /// Wrap the socket in TLS.
    pub use_tls: bool,
    /// Reconnect automatically (through the backoff penalty) after a
    /// connection is lost. When false the application reconnects from its
    /// connection callback.
    pub auto_reconnect: bool,
    /// Upper bound on a single blocking poll, in milliseconds.
    pub network_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            session: SessionType::Clean,
            use_tls: true,
            auto_reconnect: false,
            network_timeout_ms: DEFAULT_NETWORK_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    /// Validate the connection configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("connection.host must not be empty".into());
        }
        if self.keepalive_timeout == 0 {
            return Err("connection.keepalive_timeout must be at least 1".into());
        }
        if self.connection_timeout == 0 {
            return Err("connection.connection_timeout must be at least 1".into());
        }
        Ok(())
    }
}
