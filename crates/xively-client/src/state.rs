//! Library state codes.
//!
//! Every outcome inside the client is a `State`: layer transitions pass one
//! along, callbacks receive one and the public API returns one as its error
//! type. Codes are stable integers with `Ok == 0` so they can be logged and
//! compared across builds.

use thiserror::Error;

/// Outcome of an operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum State {
    #[error("ok")]
    Ok = 0,
    #[error("timeout")]
    Timeout,
    #[error("want read")]
    WantRead,
    #[error("want write")]
    WantWrite,
    #[error("written")]
    Written,
    #[error("failed writing")]
    FailedWriting,
    #[error("backoff applied, connection attempts are being held back")]
    BackoffTerminal,
    #[error("out of memory")]
    OutOfMemory,
    #[error("socket initialization error")]
    SocketInitializationError,
    #[error("could not resolve host")]
    SocketGetHostByNameError,
    #[error("socket option error")]
    SocketGetSockOptError,
    #[error("socket error")]
    SocketError,
    #[error("socket connection error")]
    SocketConnectionError,
    #[error("socket shutdown error")]
    SocketShutdownError,
    #[error("socket write error")]
    SocketWriteError,
    #[error("socket read error")]
    SocketReadError,
    #[error("socket close error")]
    SocketCloseError,
    #[error("connection reset by peer")]
    ConnectionResetByPeer,
    #[error("no handler registered for file descriptor")]
    FdHandlerNotFound,
    #[error("TLS initialization error")]
    TlsInitializationError,
    #[error("TLS failed loading certificate")]
    TlsFailedLoadingCertificate,
    #[error("TLS connect error")]
    TlsConnectError,
    #[error("TLS write error")]
    TlsWriteError,
    #[error("TLS read error")]
    TlsReadError,
    #[error("TLS close error")]
    TlsCloseError,
    #[error("TLS certificate error")]
    TlsCertificateError,
    #[error("TLS peer certificate rejected")]
    TlsFailedCertError,
    #[error("MQTT bad username or password")]
    MqttBadUsernameOrPassword,
    #[error("MQTT not authorized")]
    MqttNotAuthorized,
    #[error("MQTT identifier rejected")]
    MqttIdentifierRejected,
    #[error("MQTT unacceptable protocol version")]
    MqttUnacceptableProtocolVersion,
    #[error("MQTT server unavailable")]
    MqttServerUnavailable,
    #[error("MQTT unknown CONNACK return code")]
    MqttConnectUnknownReturnCode,
    #[error("MQTT parser error")]
    MqttParserError,
    #[error("MQTT payload size too large")]
    MqttPayloadSizeTooLarge,
    #[error("MQTT unknown message id")]
    MqttUnknownMessageId,
    #[error("MQTT subscription failed")]
    MqttSubscriptionFailed,
    #[error("MQTT subscription successful")]
    MqttSubscriptionSuccessful,
    #[error("MQTT keepalive timeout")]
    MqttKeepaliveTimeout,
    #[error("MQTT serialization error")]
    MqttSerializationError,
    #[error("internal error")]
    InternalError,
    #[error("not initialized")]
    NotInitialized,
    #[error("failed initialization")]
    FailedInitialization,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("handler not set")]
    UnsetHandlerError,
    #[error("not implemented")]
    NotImplemented,
    #[error("element not found")]
    ElementNotFound,
    #[error("serialization error")]
    SerializationError,
    #[error("truncation warning")]
    TruncationWarning,
    #[error("buffer overflow")]
    BufferOverflow,
    #[error("null or invalid context")]
    NullContext,
    #[error("will message given without a will topic")]
    NullWillTopic,
    #[error("will topic given without a will message")]
    NullWillMessage,
    #[error("no more resource available")]
    NoMoreResourceAvailable,
    #[error("filesystem resource not available")]
    FsResourceNotAvailable,
    #[error("filesystem error")]
    FsError,
    #[error("not supported")]
    NotSupported,
    #[error("event processing stopped")]
    EventProcessStopped,
    #[error("resend")]
    StateResend,
    #[error("host is empty")]
    NullHost,
    #[error("filesystem open error")]
    FsOpenError,
    #[error("filesystem resource is read only")]
    FsOpenReadOnly,
    #[error("filesystem read error")]
    FsReadError,
    #[error("filesystem write error")]
    FsWriteError,
    #[error("filesystem close error")]
    FsCloseError,
    #[error("filesystem remove error")]
    FsRemoveError,
}

const ALL: [State; 67] = [
    State::Ok,
    State::Timeout,
    State::WantRead,
    State::WantWrite,
    State::Written,
    State::FailedWriting,
    State::BackoffTerminal,
    State::OutOfMemory,
    State::SocketInitializationError,
    State::SocketGetHostByNameError,
    State::SocketGetSockOptError,
    State::SocketError,
    State::SocketConnectionError,
    State::SocketShutdownError,
    State::SocketWriteError,
    State::SocketReadError,
    State::SocketCloseError,
    State::ConnectionResetByPeer,
    State::FdHandlerNotFound,
    State::TlsInitializationError,
    State::TlsFailedLoadingCertificate,
    State::TlsConnectError,
    State::TlsWriteError,
    State::TlsReadError,
    State::TlsCloseError,
    State::TlsCertificateError,
    State::TlsFailedCertError,
    State::MqttBadUsernameOrPassword,
    State::MqttNotAuthorized,
    State::MqttIdentifierRejected,
    State::MqttUnacceptableProtocolVersion,
    State::MqttServerUnavailable,
    State::MqttConnectUnknownReturnCode,
    State::MqttParserError,
    State::MqttPayloadSizeTooLarge,
    State::MqttUnknownMessageId,
    State::MqttSubscriptionFailed,
    State::MqttSubscriptionSuccessful,
    State::MqttKeepaliveTimeout,
    State::MqttSerializationError,
    State::InternalError,
    State::NotInitialized,
    State::FailedInitialization,
    State::AlreadyInitialized,
    State::InvalidParameter,
    State::UnsetHandlerError,
    State::NotImplemented,
    State::ElementNotFound,
    State::SerializationError,
    State::TruncationWarning,
    State::BufferOverflow,
    State::NullContext,
    State::NullWillTopic,
    State::NullWillMessage,
    State::NoMoreResourceAvailable,
    State::FsResourceNotAvailable,
    State::FsError,
    State::NotSupported,
    State::EventProcessStopped,
    State::StateResend,
    State::NullHost,
    State::FsOpenError,
    State::FsOpenReadOnly,
    State::FsReadError,
    State::FsWriteError,
    State::FsCloseError,
    State::FsRemoveError,
];

impl State {
    /// Stable integer code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Reverse of [`State::code`].
    pub fn from_code(code: i32) -> Option<State> {
        usize::try_from(code).ok().and_then(|i| ALL.get(i).copied())
    }

    pub fn is_ok(self) -> bool {
        self == State::Ok
    }

    /// `Ok(())` for [`State::Ok`], the state itself otherwise.
    pub fn into_result(self) -> Result<()> {
        match self {
            State::Ok => Ok(()),
            other => Err(other),
        }
    }

    /// States after which the dispatcher cannot safely keep running.
    pub fn is_fatal(self) -> bool {
        matches!(self, State::OutOfMemory | State::InternalError)
    }
}

impl From<xively_core::Error> for State {
    fn from(err: xively_core::Error) -> Self {
        match err {
            xively_core::Error::PayloadTooLarge { .. } => State::MqttPayloadSizeTooLarge,
            xively_core::Error::Serialisation(_) => State::MqttSerializationError,
            xively_core::Error::Protocol(_) => State::MqttParserError,
        }
    }
}

impl From<std::io::Error> for State {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock => State::WantRead,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
                State::ConnectionResetByPeer
            }
            ErrorKind::ConnectionRefused | ErrorKind::NotConnected => State::SocketConnectionError,
            ErrorKind::TimedOut => State::Timeout,
            ErrorKind::OutOfMemory => State::OutOfMemory,
            _ => State::SocketError,
        }
    }
}

/// Library result type.
pub type Result<T> = std::result::Result<T, State>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_dense() {
        for (i, state) in ALL.iter().enumerate() {
            assert_eq!(state.code(), i as i32);
            assert_eq!(State::from_code(i as i32), Some(*state));
        }
        assert_eq!(State::from_code(-1), None);
        assert_eq!(State::from_code(ALL.len() as i32), None);
    }

    #[test]
    fn test_ok_is_zero() {
        assert_eq!(State::Ok.code(), 0);
        assert!(State::Ok.is_ok());
        assert_eq!(State::Ok.into_result(), Ok(()));
        assert_eq!(State::Timeout.into_result(), Err(State::Timeout));
    }

    #[test]
    fn test_codec_errors_map() {
        let err = xively_core::parse_suback_response(0x03).unwrap_err();
        assert_eq!(State::from(err), State::MqttParserError);
        let err = xively_core::Error::PayloadTooLarge { size: 2, max: 1 };
        assert_eq!(State::from(err), State::MqttPayloadSizeTooLarge);
    }

    #[test]
    fn test_display() {
        assert_eq!(State::NullWillTopic.to_string(), "will message given without a will topic");
    }
}
