//! Connection parameters and lifecycle state.

use bytes::Bytes;
use serde::Deserialize;
use xively_core::{validate_topic_name, QoS, Will};

use crate::config::ConnectionConfig;
use crate::state::{Result, State};

/// Whether the broker keeps session state between connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Discard subscriptions and unacknowledged messages on connect.
    #[default]
    Clean,
    /// Resume the previous session; unacknowledged messages are resent.
    Continue,
}

/// Connection lifecycle as reported to the connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Opening,
    Opened,
    Closing,
    Closed,
    OpenFailed,
}

/// Last will and testament.
///
/// Topic and message are optional so a half-specified will can be reported
/// instead of silently dropped: a message without a topic is
/// [`State::NullWillTopic`], a topic without a message is
/// [`State::NullWillMessage`]. Neither set means no will.
#[derive(Debug, Clone, Default)]
pub struct LastWill {
    pub topic: Option<String>,
    pub message: Option<Bytes>,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, message: impl Into<Bytes>) -> Self {
        Self {
            topic: Some(topic.into()),
            message: Some(message.into()),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Check the topic/message pairing and produce the wire-level will.
    pub fn validate(&self) -> Result<Option<Will>> {
        match (&self.topic, &self.message) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(State::NullWillTopic),
            (Some(_), None) => Err(State::NullWillMessage),
            (Some(topic), Some(message)) => {
                validate_topic_name(topic).map_err(|_| State::InvalidParameter)?;
                Ok(Some(Will {
                    topic: topic.clone(),
                    message: message.clone(),
                    qos: self.qos,
                    retain: self.retain,
                }))
            }
        }
    }
}

/// Everything needed to open (and reopen) one MQTT connection.
#[derive(Debug, Clone)]
pub struct ConnectionData {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Seconds from socket open to CONNACK.
    pub connection_timeout: u32,
    /// Seconds between keepalive pings.
    pub keepalive_timeout: u16,
    pub session: SessionType,
    pub will: LastWill,
    pub connection_state: ConnectionState,
}

impl ConnectionData {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            connection_timeout: crate::config::DEFAULT_CONNECTION_TIMEOUT,
            keepalive_timeout: crate::config::DEFAULT_KEEPALIVE_TIMEOUT,
            session: SessionType::Clean,
            will: LastWill::default(),
            connection_state: ConnectionState::Uninitialized,
        }
    }

    /// Connection defaults taken from the `[connection]` section.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout,
            keepalive_timeout: config.keepalive_timeout,
            session: config.session,
            ..Self::new(config.host.clone(), config.port)
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    pub fn session(mut self, session: SessionType) -> Self {
        self.session = session;
        self
    }

    pub fn keepalive_timeout(mut self, seconds: u16) -> Self {
        self.keepalive_timeout = seconds;
        self
    }

    pub fn connection_timeout(mut self, seconds: u32) -> Self {
        self.connection_timeout = seconds;
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.will = will;
        self
    }

    /// Reject parameters that can never produce a connection.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(State::NullHost);
        }
        if self.keepalive_timeout == 0 || self.connection_timeout == 0 {
            return Err(State::InvalidParameter);
        }
        self.will.validate()?;
        Ok(())
    }

    pub fn is_opened(&self) -> bool {
        self.connection_state == ConnectionState::Opened
    }
}
