//! MQTT client contexts.

use crate::connection::ConnectionData;
use crate::dispatcher::{Fd, TimeEventId};
use crate::events::ConnectionCallback;
use crate::layer::{Layer, TransportFactory};
use crate::session::Session;
use crate::sft::SftContext;

/// Handle of one client context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub i32);

/// Identifies one connection of one context. Events scheduled for a
/// connection that has since been torn down are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContextKey {
    pub handle: ContextHandle,
    pub serial: u64,
}

/// One MQTT session: its layer chain, connection data and session state.
pub struct Context {
    pub(crate) handle: ContextHandle,
    /// Bumped every time a layer chain is built or torn down.
    pub(crate) serial: u64,
    /// Index 0 is the bottom (transport) layer.
    pub(crate) layers: Vec<Option<Box<dyn Layer>>>,
    pub(crate) connection: Option<ConnectionData>,
    pub(crate) io_timeouts: Vec<TimeEventId>,
    pub(crate) fds: Vec<Fd>,
    pub(crate) session: Session,
    pub(crate) on_connection: Option<ConnectionCallback>,
    pub(crate) transport: Option<TransportFactory>,
    pub(crate) sft: Option<SftContext>,
}

impl Context {
    pub(crate) fn new(handle: ContextHandle, transport: Option<TransportFactory>) -> Self {
        Self {
            handle,
            serial: 0,
            layers: Vec::new(),
            connection: None,
            io_timeouts: Vec::new(),
            fds: Vec::new(),
            session: Session::new(),
            on_connection: None,
            transport,
            sft: None,
        }
    }

    pub(crate) fn key(&self) -> ContextKey {
        ContextKey {
            handle: self.handle,
            serial: self.serial,
        }
    }

    /// Whether a layer chain exists for the current connection.
    pub(crate) fn has_chain(&self) -> bool {
        !self.layers.is_empty()
    }

    pub(crate) fn top_layer(&self) -> Option<usize> {
        self.layers.len().checked_sub(1)
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn connection(&self) -> Option<&ConnectionData> {
        self.connection.as_ref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
