//! PINGREQ scheduling and the PINGRESP grace window.
//!
//! The keepalive timer is pushed back by every packet written. When it
//! fires a PINGREQ goes out and the grace timer starts; any inbound packet
//! cancels the grace timer, expiry closes the connection with
//! [`State::MqttKeepaliveTimeout`].

use log::{error, trace};
use xively_core::Packet;

use super::{LogicLayer, LogicTask};
use crate::layer::{LayerCx, LayerData, LayerOp};
use crate::state::State;

fn arm(cx: &mut LayerCx<'_>, task: LogicTask) -> Option<crate::dispatcher::TimeEventId> {
    let interval = LogicLayer::keepalive_seconds(cx);
    match cx.schedule_this_in(interval, LayerOp::Push, LayerData::Task(task), State::Ok) {
        Ok(id) => Some(id),
        Err(err) => {
            error!("could not arm {:?}: {}", task, err);
            None
        }
    }
}

pub(super) fn start(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) {
    if let Some(id) = layer.keepalive.take() {
        cx.cancel_timeout(id);
    }
    layer.keepalive = arm(cx, LogicTask::KeepaliveDue);
}

/// Traffic went out: the next ping is due a full interval from now.
pub(super) fn restart(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) {
    let interval = LogicLayer::keepalive_seconds(cx);
    match layer.keepalive {
        Some(id) if cx.restart_timeout(id, interval).is_ok() => {}
        _ => start(layer, cx),
    }
}

pub(super) fn fire(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) -> State {
    layer.keepalive = None;
    trace!("keepalive due, sending PINGREQ");
    if layer.ping_timeout.is_none() {
        layer.ping_timeout = arm(cx, LogicTask::KeepaliveExpired);
    }
    layer.send(cx, Packet::Pingreq)
}
