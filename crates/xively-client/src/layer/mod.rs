//! The layer chain.
//!
//! A connection is an ordered list of layers, transport at index 0 and MQTT
//! logic on top. Data written by the application travels down through
//! `push`, data read from the network travels up through `pull`. Layers
//! never call a neighbour directly: every hop is scheduled on the
//! dispatcher, and while a layer runs it is detached from its slot so it
//! can be borrowed mutably alongside the rest of the client.
//!
//! Lifecycle:
//! - `init` runs top to bottom; the transport then starts connecting.
//! - `connect` runs bottom to top once the transport is up.
//! - `close` runs top to bottom; the transport then sends
//!   `close_externally` back up so the logic layer can report the result.
//! - Write completions travel up as `push` calls carrying
//!   [`State::Written`] or [`State::FailedWriting`].

pub mod codec;
pub mod logic;
pub mod socket;
pub mod tls;

use bytes::Bytes;
use log::{error, trace, warn};
use mio::Interest;
use xively_core::{Packet, PacketType};

use crate::client::Xively;
use crate::config::Config;
use crate::connection::ConnectionData;
use crate::context::{Context, ContextHandle, ContextKey};
use crate::dispatcher::{Fd, TimeEventId};
use crate::session::Session;
use crate::state::{Result, State};

pub use codec::CodecLayer;
pub use logic::{LogicLayer, LogicTask};
pub use socket::SocketLayer;
pub use tls::TlsLayer;

/// Builds the bottom layer of each new connection in place of the socket.
pub type TransportFactory = Box<dyn FnMut() -> Box<dyn Layer>>;

/// Layer entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOp {
    Push,
    Pull,
    Close,
    CloseExternally,
    Init,
    Connect,
    PostConnect,
}

/// What travels between layers.
#[derive(Debug)]
pub enum LayerData {
    Empty,
    /// Raw bytes: network data going up, ciphertext or a certificate.
    Raw(Bytes),
    /// An encoded packet going down. The payload is sent from the
    /// publisher's buffer without copying.
    Frame { header: Bytes, payload: Bytes },
    /// A decoded packet going up, or a packet to encode going down.
    Packet(Box<Packet>),
    /// Write completion of one packet.
    Sent {
        kind: PacketType,
        packet_id: Option<u16>,
    },
    /// Work for the logic layer.
    Task(LogicTask),
}

/// Whether `state` reports the completion of a write from below.
pub fn is_write_completion(state: State) -> bool {
    matches!(state, State::Written | State::FailedWriting)
}

/// One stage of the I/O pipeline. The provided methods pass everything
/// through to the neighbouring layer.
pub trait Layer {
    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if is_write_completion(state) {
            cx.schedule_next(LayerOp::Push, data, state)
        } else {
            cx.schedule_prev(LayerOp::Push, data, state)
        }
    }

    fn pull(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        cx.schedule_next(LayerOp::Pull, data, state)
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if cx.is_bottom() {
            cx.schedule_next(LayerOp::CloseExternally, data, state)
        } else {
            cx.schedule_prev(LayerOp::Close, data, state)
        }
    }

    fn close_externally(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        cx.schedule_next(LayerOp::CloseExternally, data, state)
    }

    fn init(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if cx.is_bottom() {
            cx.schedule_next(LayerOp::Connect, data, state)
        } else {
            cx.schedule_prev(LayerOp::Init, data, state)
        }
    }

    fn connect(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        cx.schedule_next(LayerOp::Connect, data, state)
    }

    fn post_connect(&mut self, _cx: &mut LayerCx<'_>, _data: LayerData, _state: State) -> State {
        State::Ok
    }
}

/// What a running layer can reach: its neighbours, its context and the
/// client.
pub struct LayerCx<'a> {
    pub(crate) xi: &'a mut Xively,
    pub(crate) key: ContextKey,
    pub(crate) index: usize,
}

impl LayerCx<'_> {
    pub fn context_handle(&self) -> ContextHandle {
        self.key.handle
    }

    /// Position in the chain, 0 being the transport.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_bottom(&self) -> bool {
        self.index == 0
    }

    pub fn is_top(&self) -> bool {
        self.context()
            .map_or(true, |context| self.index + 1 >= context.layers.len())
    }

    /// Current dispatcher step.
    pub fn now(&self) -> i64 {
        self.xi.dispatcher.current_step()
    }

    pub fn xively(&mut self) -> &mut Xively {
        &mut *self.xi
    }

    pub fn connection(&self) -> Option<&ConnectionData> {
        self.context()?.connection.as_ref()
    }

    pub(crate) fn context(&self) -> Option<&Context> {
        self.xi
            .contexts
            .get(self.key.handle.0)
            .filter(|context| context.serial == self.key.serial)
    }

    pub(crate) fn context_mut(&mut self) -> Option<&mut Context> {
        let serial = self.key.serial;
        self.xi
            .contexts
            .get_mut(self.key.handle.0)
            .filter(|context| context.serial == serial)
    }

    pub(crate) fn session(&mut self) -> Option<&mut Session> {
        self.context_mut().map(|context| &mut context.session)
    }

    /// Run `op` on the layer below.
    pub fn schedule_prev(&mut self, op: LayerOp, data: LayerData, state: State) -> State {
        match self.index.checked_sub(1) {
            Some(target) => self.schedule_at(target, op, data, state),
            None => {
                trace!("{:?} below the bottom layer dropped", op);
                State::Ok
            }
        }
    }

    /// Run `op` on the layer above.
    pub fn schedule_next(&mut self, op: LayerOp, data: LayerData, state: State) -> State {
        if self.is_top() {
            trace!("{:?} above the top layer dropped", op);
            return State::Ok;
        }
        self.schedule_at(self.index + 1, op, data, state)
    }

    /// Run `op` on this layer again.
    pub fn schedule_this(&mut self, op: LayerOp, data: LayerData, state: State) -> State {
        self.schedule_at(self.index, op, data, state)
    }

    /// Run `op` on this layer `delay` steps from now. The event is owned by
    /// the connection and cancelled when it is torn down.
    pub fn schedule_this_in(
        &mut self,
        delay: i64,
        op: LayerOp,
        data: LayerData,
        state: State,
    ) -> Result<TimeEventId> {
        let id = schedule_layer_call(self.xi, self.key, self.index, op, data, state, delay)?;
        let xi = &mut *self.xi;
        if let Some(context) = xi.contexts.get_mut(self.key.handle.0) {
            let dispatcher = &xi.dispatcher;
            context.io_timeouts.retain(|pending| dispatcher.is_pending(*pending));
            context.io_timeouts.push(id);
        }
        Ok(id)
    }

    /// Move a pending timeout to `delay` steps from now.
    pub fn restart_timeout(&mut self, id: TimeEventId, delay: i64) -> Result<()> {
        self.xi.dispatcher.restart(id, delay)
    }

    pub fn cancel_timeout(&mut self, id: TimeEventId) {
        let _ = self.xi.dispatcher.cancel(id);
        if let Some(context) = self.context_mut() {
            context.io_timeouts.retain(|pending| *pending != id);
        }
    }

    /// Start closing the whole connection with `state` as the cause.
    pub fn close_chain(&mut self, state: State) -> State {
        let Some(top) = self.context().and_then(Context::top_layer) else {
            return State::Ok;
        };
        self.schedule_at(top, LayerOp::Close, LayerData::Empty, state)
    }

    /// Reserve a descriptor for a socket owned by this connection.
    pub(crate) fn register_fd(&mut self) -> Result<Fd> {
        let fd = self.xi.allocate_fd();
        self.xi.dispatcher.register_socket_fd(fd)?;
        if let Some(context) = self.context_mut() {
            context.fds.push(fd);
        }
        Ok(fd)
    }

    pub(crate) fn unregister_fd(&mut self, fd: Fd) {
        let _ = self.xi.dispatcher.unregister_socket_fd(fd);
        if let Some(context) = self.context_mut() {
            context.fds.retain(|registered| *registered != fd);
        }
    }

    /// Call this layer's `pull` once `fd` reports `interest`.
    pub(crate) fn continue_on_socket(&mut self, fd: Fd, interest: Interest) -> Result<()> {
        let (key, index) = (self.key, self.index);
        self.xi.dispatcher.continue_when_evt_on_socket(
            fd,
            interest,
            Box::new(move |xi: &mut Xively| {
                call_layer(xi, key, index, LayerOp::Pull, LayerData::Empty, State::Ok)
            }),
        )
    }

    fn schedule_at(&mut self, index: usize, op: LayerOp, data: LayerData, state: State) -> State {
        match schedule_layer_call(self.xi, self.key, index, op, data, state, 0) {
            Ok(_) => State::Ok,
            Err(err) => {
                error!("could not schedule {:?} on layer {}: {}", op, index, err);
                err
            }
        }
    }
}

pub(crate) fn schedule_layer_call(
    xi: &mut Xively,
    key: ContextKey,
    index: usize,
    op: LayerOp,
    data: LayerData,
    state: State,
    delay: i64,
) -> Result<TimeEventId> {
    xi.dispatcher.execute_in(
        Box::new(move |xi: &mut Xively| call_layer(xi, key, index, op, data, state)),
        delay,
    )
}

/// Detach the layer at `index`, run `op` on it and put it back unless the
/// connection was torn down meanwhile.
pub(crate) fn call_layer(
    xi: &mut Xively,
    key: ContextKey,
    index: usize,
    op: LayerOp,
    data: LayerData,
    state: State,
) -> State {
    let Some(context) = xi.contexts.get_mut(key.handle.0) else {
        trace!("{:?} for deleted context {} dropped", op, key.handle.0);
        return State::Ok;
    };
    if context.serial != key.serial {
        trace!("{:?} for a closed connection dropped", op);
        return State::Ok;
    }
    let Some(mut layer) = context.layers.get_mut(index).and_then(Option::take) else {
        warn!("layer {} is not available for {:?}", index, op);
        return State::Ok;
    };

    let result = {
        let mut cx = LayerCx {
            xi: &mut *xi,
            key,
            index,
        };
        match op {
            LayerOp::Push => layer.push(&mut cx, data, state),
            LayerOp::Pull => layer.pull(&mut cx, data, state),
            LayerOp::Close => layer.close(&mut cx, data, state),
            LayerOp::CloseExternally => layer.close_externally(&mut cx, data, state),
            LayerOp::Init => layer.init(&mut cx, data, state),
            LayerOp::Connect => layer.connect(&mut cx, data, state),
            LayerOp::PostConnect => layer.post_connect(&mut cx, data, state),
        }
    };

    if let Some(context) = xi.contexts.get_mut(key.handle.0) {
        if context.serial == key.serial {
            if let Some(slot) = context.layers.get_mut(index) {
                if slot.is_none() {
                    *slot = Some(layer);
                }
            }
        }
    }
    result
}

/// Build the chain for a new connection: transport, optional TLS, codec
/// and logic.
pub(crate) fn build_chain(
    config: &Config,
    transport: Option<&mut TransportFactory>,
) -> Vec<Option<Box<dyn Layer>>> {
    let limits = &config.limits;
    let mut layers: Vec<Option<Box<dyn Layer>>> = Vec::with_capacity(4);
    match transport {
        Some(factory) => layers.push(Some(factory())),
        None => {
            layers.push(Some(Box::new(SocketLayer::new())));
            if config.connection.use_tls {
                layers.push(Some(Box::new(TlsLayer::new(config.tls.clone()))));
            }
        }
    }
    layers.push(Some(Box::new(CodecLayer::new(
        limits.max_payload_size,
        limits.max_packet_size,
    ))));
    layers.push(Some(Box::new(LogicLayer::new())));
    layers
}

/// Drop the current chain of `handle` along with every timeout and
/// descriptor it owned.
pub(crate) fn teardown_chain(xi: &mut Xively, handle: ContextHandle) {
    let serial = xi.next_serial();
    let Some(context) = xi.contexts.get_mut(handle.0) else {
        return;
    };
    context.serial = serial;
    let timeouts = std::mem::take(&mut context.io_timeouts);
    let fds = std::mem::take(&mut context.fds);
    let layers = std::mem::take(&mut context.layers);
    for id in timeouts {
        let _ = xi.dispatcher.cancel(id);
    }
    for fd in fds {
        let _ = xi.dispatcher.unregister_socket_fd(fd);
    }
    drop(layers);
}
