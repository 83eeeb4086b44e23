//! Sequential subscriptions: one SUBSCRIBE in flight, the next one goes
//! out when its SUBACK arrives.

use log::{debug, info, warn};
use xively_core::{Packet, Subscribe, Suback, SubackStatus};

use super::LogicLayer;
use crate::events::SubscriptionData;
use crate::layer::LayerCx;
use crate::session::SubscriptionHandler;
use crate::state::State;

/// Send the front of the subscription queue unless one is in flight.
pub(super) fn send_next(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) -> State {
    let Some(session) = cx.session() else {
        return State::Ok;
    };
    if session.subscription_in_flight() || session.subscriptions.is_empty() {
        return State::Ok;
    }
    let packet_id = match session.ids.allocate() {
        Ok(id) => id,
        Err(err) => {
            warn!("no message id for SUBSCRIBE: {}", err);
            return State::Ok;
        }
    };
    let Some(front) = session.subscriptions.front_mut() else {
        return State::Ok;
    };
    front.packet_id = Some(packet_id);
    let subscribe = Subscribe {
        packet_id,
        topics: vec![(front.topic.clone(), front.qos)],
    };
    debug!("subscribing to {} as {}", front.topic, packet_id);
    layer.send(cx, Packet::Subscribe(subscribe))
}

pub(super) fn on_suback(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, suback: Suback) -> State {
    let Some(session) = cx.session() else {
        return State::Ok;
    };
    let matches = session
        .subscriptions
        .front()
        .is_some_and(|front| front.packet_id == Some(suback.packet_id));
    if !matches {
        warn!("SUBACK for unknown message id {}", suback.packet_id);
        return State::Ok;
    }
    let Some(pending) = session.subscriptions.pop_front() else {
        return State::Ok;
    };
    session.ids.release(suback.packet_id);

    let status = suback.return_codes.first().copied().unwrap_or(SubackStatus::Failed);
    let handle = cx.context_handle();
    let state = match status.granted_qos() {
        Some(qos) => {
            info!("subscribed to {} with {:?}", pending.topic, qos);
            State::MqttSubscriptionSuccessful
        }
        None => {
            warn!("subscription to {} refused", pending.topic);
            State::MqttSubscriptionFailed
        }
    };

    let mut callback = pending.callback;
    if let Some(callback) = callback.as_mut() {
        let data = SubscriptionData::Suback {
            topic: &pending.topic,
            status,
        };
        callback(cx.xively(), handle, data, state);
    }
    if let (Some(qos), Some(session)) = (status.granted_qos(), cx.session()) {
        session.set_handler(SubscriptionHandler {
            filter: pending.topic,
            qos,
            callback,
        });
    }
    send_next(layer, cx)
}
