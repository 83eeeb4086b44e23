//! MQTT session logic, the top of every chain.
//!
//! Phases run `Disconnected -> Connecting -> Connected -> Disconnecting`
//! and back. The layer owns the CONNECT/CONNACK exchange, the keepalive
//! timers, QoS retransmission and the sequential subscription queue. Work
//! requested by the public API arrives as [`LogicTask`]s pushed onto this
//! layer.

mod keepalive;
mod publish;
mod subscribe;

use log::{debug, error, info, warn};
use xively_core::{ConnackCode, Connect, Packet, PacketType};

use super::{teardown_chain, Layer, LayerCx, LayerData, LayerOp};
use crate::backoff::update_backoff_penalty;
use crate::client::Xively;
use crate::connection::{ConnectionState, SessionType};
use crate::context::ContextHandle;
use crate::dispatcher::TimeEventId;
use crate::events::PublishCallback;
use crate::state::State;

/// Work items for the logic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicTask {
    /// Send everything waiting in the outbox.
    Publish,
    /// Send the next queued subscription.
    Subscribe,
    /// Retransmission timer of an unacknowledged message.
    Retry(u16),
    KeepaliveDue,
    KeepaliveExpired,
    ConnectTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

pub struct LogicLayer {
    phase: Phase,
    keepalive: Option<TimeEventId>,
    ping_timeout: Option<TimeEventId>,
    connect_timeout: Option<TimeEventId>,
    /// Cause the connection is being closed with.
    close_state: State,
    close_forwarded: bool,
    opened: bool,
}

impl Default for LogicLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicLayer {
    pub fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            keepalive: None,
            ping_timeout: None,
            connect_timeout: None,
            close_state: State::Ok,
            close_forwarded: false,
            opened: false,
        }
    }

    fn keepalive_seconds(cx: &LayerCx<'_>) -> i64 {
        cx.connection()
            .map_or(i64::from(crate::config::DEFAULT_KEEPALIVE_TIMEOUT), |data| {
                i64::from(data.keepalive_timeout)
            })
    }

    fn cancel_timers(&mut self, cx: &mut LayerCx<'_>) {
        for id in [
            self.keepalive.take(),
            self.ping_timeout.take(),
            self.connect_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            cx.cancel_timeout(id);
        }
    }

    fn send(&mut self, cx: &mut LayerCx<'_>, packet: Packet) -> State {
        cx.schedule_prev(LayerOp::Push, LayerData::Packet(Box::new(packet)), State::Ok)
    }

    fn send_connect(&mut self, cx: &mut LayerCx<'_>) -> State {
        let Some(data) = cx.connection().cloned() else {
            return cx.close_chain(State::NullContext);
        };
        let will = match data.will.validate() {
            Ok(will) => will,
            Err(err) => return cx.close_chain(err),
        };
        let device_id = cx.xively().device_id().to_string();
        let connect = Connect {
            clean_session: data.session == SessionType::Clean,
            keep_alive: data.keepalive_timeout,
            client_id: device_id.clone(),
            will,
            username: Some(data.username.unwrap_or(device_id)),
            password: data.password.map(String::into_bytes),
        };
        debug!(
            "sending CONNECT to {}:{} (clean session: {})",
            data.host, data.port, connect.clean_session
        );
        self.send(cx, Packet::Connect(connect))
    }

    fn on_connack(&mut self, cx: &mut LayerCx<'_>, return_code: u8) -> State {
        if self.phase != Phase::Connecting {
            warn!("CONNACK outside of connect, ignored");
            return State::Ok;
        }
        if let Some(id) = self.connect_timeout.take() {
            cx.cancel_timeout(id);
        }
        let state = match ConnackCode::from_u8(return_code) {
            Some(ConnackCode::Accepted) => State::Ok,
            Some(ConnackCode::UnacceptableProtocolVersion) => State::MqttUnacceptableProtocolVersion,
            Some(ConnackCode::IdentifierRejected) => State::MqttIdentifierRejected,
            Some(ConnackCode::ServerUnavailable) => State::MqttServerUnavailable,
            Some(ConnackCode::BadUsernamePassword) => State::MqttBadUsernameOrPassword,
            Some(ConnackCode::NotAuthorized) => State::MqttNotAuthorized,
            None => State::MqttConnectUnknownReturnCode,
        };
        if state != State::Ok {
            error!("broker refused the connection: {}", state);
            return cx.close_chain(state);
        }

        self.phase = Phase::Connected;
        self.opened = true;
        let handle = cx.context_handle();
        info!("context {} connected", handle.0);
        update_backoff_penalty(cx.xively(), State::Ok);

        let mut clean = false;
        if let Some(context) = cx.context_mut() {
            if let Some(data) = context.connection.as_mut() {
                data.connection_state = ConnectionState::Opened;
                clean = data.session == SessionType::Clean;
            }
            if clean {
                context.session.reset_for_clean_start();
            }
        }

        keepalive::start(self, cx);
        cx.xively().notify_connection(handle, State::Ok);
        cx.schedule_this(LayerOp::PostConnect, LayerData::Empty, State::Ok)
    }

    fn on_packet(&mut self, cx: &mut LayerCx<'_>, packet: Packet) -> State {
        if let Some(id) = self.ping_timeout.take() {
            cx.cancel_timeout(id);
        }
        match packet {
            Packet::Connack(connack) => self.on_connack(cx, connack.return_code),
            _ if self.phase != Phase::Connected => {
                debug!("{:?} while not connected, ignored", packet.packet_type());
                State::Ok
            }
            Packet::Publish(publish) => publish::on_publish(self, cx, publish),
            Packet::Puback { packet_id } => publish::on_puback(self, cx, packet_id),
            Packet::Pubrec { packet_id } => publish::on_pubrec(self, cx, packet_id),
            Packet::Pubrel { packet_id } => publish::on_pubrel(self, cx, packet_id),
            Packet::Pubcomp { packet_id } => publish::on_pubcomp(self, cx, packet_id),
            Packet::Suback(suback) => subscribe::on_suback(self, cx, suback),
            Packet::Pingresp => State::Ok,
            Packet::Unsuback { .. } => State::Ok,
            other => {
                warn!("unexpected {:?} from broker", other.packet_type());
                State::Ok
            }
        }
    }

    /// Write completion of one packet handed to the codec.
    fn on_sent(&mut self, cx: &mut LayerCx<'_>, kind: PacketType, packet_id: Option<u16>, state: State) -> State {
        let written = state == State::Written;
        if written && self.phase == Phase::Connected {
            keepalive::restart(self, cx);
        }
        match (kind, packet_id) {
            (PacketType::Publish, None) => {
                let callback = cx
                    .session()
                    .and_then(|session| session.awaiting_write.pop_front())
                    .flatten();
                let result = if written { State::Ok } else { write_failure(state) };
                let handle = cx.context_handle();
                complete_publish(cx.xively(), handle, callback, result);
                State::Ok
            }
            (PacketType::Publish | PacketType::Pubrel, Some(id)) if !written && state != State::FailedWriting => {
                publish::abandon(cx, id, state);
                State::Ok
            }
            (PacketType::Disconnect, _) => {
                if !self.close_forwarded {
                    self.close_forwarded = true;
                    return cx.schedule_prev(LayerOp::Close, LayerData::Empty, self.close_state);
                }
                State::Ok
            }
            (PacketType::Connect, _) if !written => cx.close_chain(write_failure(state)),
            _ => State::Ok,
        }
    }

    fn on_task(&mut self, cx: &mut LayerCx<'_>, task: LogicTask) -> State {
        match task {
            LogicTask::ConnectTimeout => {
                self.connect_timeout = None;
                if self.phase == Phase::Connecting {
                    error!("no CONNACK within the connection timeout");
                    return cx.close_chain(State::Timeout);
                }
                State::Ok
            }
            LogicTask::KeepaliveExpired => {
                self.ping_timeout = None;
                error!("no PINGRESP within the keepalive window");
                cx.close_chain(State::MqttKeepaliveTimeout)
            }
            _ if self.phase != Phase::Connected => State::Ok,
            LogicTask::Publish => publish::drain_outbox(self, cx),
            LogicTask::Subscribe => subscribe::send_next(self, cx),
            LogicTask::Retry(id) => publish::retry(self, cx, id),
            LogicTask::KeepaliveDue => keepalive::fire(self, cx),
        }
    }

    /// The chain is gone: settle the session and report the outcome.
    fn finish(&mut self, cx: &mut LayerCx<'_>, cause: State) -> State {
        self.cancel_timers(cx);
        self.phase = Phase::Disconnected;
        let handle = cx.context_handle();
        let opened = self.opened;
        let xi = cx.xively();

        update_backoff_penalty(xi, cause);
        teardown_chain(xi, handle);

        let Some(context) = xi.contexts.get_mut(handle.0) else {
            return State::Ok;
        };
        let clean = context
            .connection
            .as_ref()
            .is_some_and(|data| data.session == SessionType::Clean);
        context.session.rewind();
        let mut abandoned = context.session.discard_awaiting_write();
        if clean {
            abandoned.extend(context.session.discard_unacked());
        }
        if let Some(data) = context.connection.as_mut() {
            data.connection_state = if opened || cause == State::Ok {
                ConnectionState::Closed
            } else {
                ConnectionState::OpenFailed
            };
        }
        info!("context {} disconnected: {}", handle.0, cause);

        let failure = if cause == State::Ok { State::FailedWriting } else { cause };
        for callback in abandoned {
            callback(xi, handle, failure);
        }
        crate::sft::on_connection_failed(xi, handle);
        xi.notify_connection(handle, cause);

        if cause != State::Ok && xi.config.connection.auto_reconnect {
            xi.reconnect_after_loss(handle);
        }
        State::Ok
    }
}

fn write_failure(state: State) -> State {
    match state {
        State::FailedWriting => State::SocketWriteError,
        other => other,
    }
}

/// Hand a publish outcome to the application.
fn complete_publish(xi: &mut Xively, handle: ContextHandle, callback: Option<PublishCallback>, state: State) {
    if let Some(callback) = callback {
        callback(xi, handle, state);
    }
}

impl Layer for LogicLayer {
    fn init(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        self.phase = Phase::Connecting;
        self.opened = false;
        self.close_forwarded = false;
        self.close_state = State::Ok;
        let timeout = cx
            .connection()
            .map_or(i64::from(crate::config::DEFAULT_CONNECTION_TIMEOUT), |data| {
                i64::from(data.connection_timeout)
            });
        match cx.schedule_this_in(
            timeout,
            LayerOp::Push,
            LayerData::Task(LogicTask::ConnectTimeout),
            State::Ok,
        ) {
            Ok(id) => self.connect_timeout = Some(id),
            Err(err) => return err,
        }
        cx.schedule_prev(LayerOp::Init, data, state)
    }

    fn connect(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        if self.phase != Phase::Connecting {
            return State::Ok;
        }
        if state != State::Ok {
            error!("transport failed to connect: {}", state);
            return cx.close_chain(state);
        }
        self.send_connect(cx)
    }

    fn post_connect(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, _state: State) -> State {
        if self.phase != Phase::Connected {
            return State::Ok;
        }
        publish::resend_unacked(self, cx);
        publish::drain_outbox(self, cx);
        subscribe::send_next(self, cx);
        let handle = cx.context_handle();
        crate::sft::on_connected(cx.xively(), handle);
        State::Ok
    }

    fn pull(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if state != State::Ok {
            return cx.close_chain(state);
        }
        match data {
            LayerData::Packet(packet) => self.on_packet(cx, *packet),
            _ => State::Ok,
        }
    }

    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        match data {
            LayerData::Sent { kind, packet_id } => self.on_sent(cx, kind, packet_id, state),
            LayerData::Task(task) => self.on_task(cx, task),
            _ => State::Ok,
        }
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        if let Some(data) = cx.context_mut().and_then(|context| context.connection.as_mut()) {
            data.connection_state = ConnectionState::Closing;
        }
        match self.phase {
            Phase::Disconnecting => {
                if state != State::Ok && !self.close_forwarded {
                    self.close_forwarded = true;
                    self.close_state = state;
                    return cx.schedule_prev(LayerOp::Close, LayerData::Empty, state);
                }
                State::Ok
            }
            Phase::Connected if state == State::Ok => {
                debug!("disconnecting gracefully");
                self.phase = Phase::Disconnecting;
                self.close_state = State::Ok;
                self.cancel_timers(cx);
                self.send(cx, Packet::Disconnect)
            }
            _ => {
                self.phase = Phase::Disconnecting;
                self.close_state = state;
                self.close_forwarded = true;
                self.cancel_timers(cx);
                cx.schedule_prev(LayerOp::Close, LayerData::Empty, state)
            }
        }
    }

    fn close_externally(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        let cause = if self.close_state != State::Ok {
            self.close_state
        } else {
            state
        };
        self.finish(cx, cause)
    }
}
