//! Outbound publishes and the QoS 1/2 acknowledgment exchanges.

use log::{debug, error, trace, warn};
use xively_core::{Packet, Publish, QoS};

use super::{complete_publish, LogicLayer, LogicTask};
use crate::events::SubscriptionData;
use crate::layer::{LayerCx, LayerData, LayerOp};
use crate::session::{OutboundPublish, PendingPublish, PublishStage};
use crate::state::State;

fn arm_retry(cx: &mut LayerCx<'_>, packet_id: u16) {
    let interval = LogicLayer::keepalive_seconds(cx);
    let scheduled = cx.schedule_this_in(
        interval,
        LayerOp::Push,
        LayerData::Task(LogicTask::Retry(packet_id)),
        State::Ok,
    );
    match scheduled {
        Ok(event) => {
            if let Some(pending) = cx.session().and_then(|s| s.pending_mut(packet_id)) {
                pending.retry_event = Some(event);
            }
        }
        Err(err) => error!("could not arm retransmission of {}: {}", packet_id, err),
    }
}

fn disarm_retry(cx: &mut LayerCx<'_>, packet_id: u16) {
    let event = cx
        .session()
        .and_then(|s| s.pending_mut(packet_id))
        .and_then(|pending| pending.retry_event.take());
    if let Some(event) = event {
        cx.cancel_timeout(event);
    }
}

/// Send every publish queued in the outbox, in submission order.
pub(super) fn drain_outbox(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) -> State {
    while let Some(outbound) = cx.session().and_then(|s| s.outbox.pop_front()) {
        let state = send_new(layer, cx, outbound);
        if state != State::Ok {
            return state;
        }
    }
    State::Ok
}

fn send_new(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, outbound: OutboundPublish) -> State {
    if outbound.qos == QoS::AtMostOnce {
        let packet = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: outbound.retain,
            topic: outbound.topic,
            packet_id: None,
            payload: outbound.payload,
        });
        if let Some(session) = cx.session() {
            session.awaiting_write.push_back(outbound.callback);
        }
        return layer.send(cx, packet);
    }

    let packet_id = match outbound.packet_id {
        Some(id) => id,
        None => match cx.session().map(|s| s.ids.allocate()) {
            Some(Ok(id)) => id,
            Some(Err(err)) => {
                let handle = cx.context_handle();
                complete_publish(cx.xively(), handle, outbound.callback, err);
                return State::Ok;
            }
            None => return State::Ok,
        },
    };
    let pending = PendingPublish::new(outbound, packet_id);
    let packet = pending.packet(false);
    trace!("publishing {} on {} as {:?}", packet_id, pending.topic, pending.qos);
    if let Some(session) = cx.session() {
        session.unacked.push_back(pending);
    }
    arm_retry(cx, packet_id);
    layer.send(cx, packet)
}

/// Resend what the previous connection left unacknowledged.
pub(super) fn resend_unacked(layer: &mut LogicLayer, cx: &mut LayerCx<'_>) {
    let ids = cx.session().map(|s| s.unacked_ids()).unwrap_or_default();
    for id in ids {
        let Some(packet) = cx.session().and_then(|s| s.pending(id)).map(|p| p.packet(true)) else {
            continue;
        };
        debug!("resending {} after reconnect", id);
        arm_retry(cx, id);
        layer.send(cx, packet);
    }
}

/// Retransmission timer fired.
pub(super) fn retry(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    let max_retries = cx.xively().config.limits.max_publish_retries;
    let Some(pending) = cx.session().and_then(|s| s.pending_mut(packet_id)) else {
        return State::Ok;
    };
    pending.retry_event = None;
    if pending.send_count > max_retries {
        warn!("message {} unacknowledged after {} retries", packet_id, max_retries);
        abandon(cx, packet_id, State::Timeout);
        return State::Ok;
    }
    pending.send_count += 1;
    let packet = pending.packet(true);
    debug!("retransmitting {} ({:?})", packet_id, pending.stage);
    arm_retry(cx, packet_id);
    layer.send(cx, packet)
}

/// Give up on an exchange and report `state` to the publisher.
pub(super) fn abandon(cx: &mut LayerCx<'_>, packet_id: u16, state: State) {
    disarm_retry(cx, packet_id);
    let callback = cx
        .session()
        .and_then(|s| s.complete(packet_id))
        .and_then(|pending| pending.callback);
    let handle = cx.context_handle();
    complete_publish(cx.xively(), handle, callback, state);
}

fn stage_of(cx: &mut LayerCx<'_>, packet_id: u16) -> Option<PublishStage> {
    cx.session().and_then(|s| s.pending(packet_id)).map(|p| p.stage)
}

fn unknown(kind: &str, packet_id: u16) -> State {
    warn!("{} for unknown message id {}: {}", kind, packet_id, State::MqttUnknownMessageId);
    State::Ok
}

fn acknowledged(cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    disarm_retry(cx, packet_id);
    let callback = cx
        .session()
        .and_then(|s| s.complete(packet_id))
        .and_then(|pending| pending.callback);
    trace!("message {} delivered", packet_id);
    let handle = cx.context_handle();
    complete_publish(cx.xively(), handle, callback, State::Ok);
    State::Ok
}

pub(super) fn on_puback(_layer: &mut LogicLayer, cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    match stage_of(cx, packet_id) {
        Some(PublishStage::AwaitingPuback) => acknowledged(cx, packet_id),
        _ => unknown("PUBACK", packet_id),
    }
}

pub(super) fn on_pubrec(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    match stage_of(cx, packet_id) {
        Some(PublishStage::AwaitingPubrec) | Some(PublishStage::AwaitingPubcomp) => {
            disarm_retry(cx, packet_id);
            if let Some(pending) = cx.session().and_then(|s| s.pending_mut(packet_id)) {
                pending.stage = PublishStage::AwaitingPubcomp;
                pending.send_count = 1;
            }
            arm_retry(cx, packet_id);
            layer.send(cx, Packet::Pubrel { packet_id })
        }
        _ => unknown("PUBREC", packet_id),
    }
}

pub(super) fn on_pubcomp(_layer: &mut LogicLayer, cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    match stage_of(cx, packet_id) {
        Some(PublishStage::AwaitingPubcomp) => acknowledged(cx, packet_id),
        _ => unknown("PUBCOMP", packet_id),
    }
}

/// Second half of an inbound QoS 2 delivery.
pub(super) fn on_pubrel(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, packet_id: u16) -> State {
    let known = cx.session().is_some_and(|s| s.release_qos2(packet_id));
    if !known {
        debug!("PUBREL for {} without a pending delivery", packet_id);
    }
    layer.send(cx, Packet::Pubcomp { packet_id })
}

/// Inbound publish: acknowledge per QoS and hand it to the subscriber.
pub(super) fn on_publish(layer: &mut LogicLayer, cx: &mut LayerCx<'_>, publish: Publish) -> State {
    let deliver = match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => true,
        (QoS::AtLeastOnce, Some(packet_id)) => {
            layer.send(cx, Packet::Puback { packet_id });
            true
        }
        (QoS::ExactlyOnce, Some(packet_id)) => {
            let first = cx.session().is_some_and(|s| s.receive_qos2(packet_id));
            layer.send(cx, Packet::Pubrec { packet_id });
            first
        }
        (_, None) => {
            error!("QoS {:?} publish without a message id", publish.qos);
            return cx.close_chain(State::MqttParserError);
        }
    };
    if !deliver {
        debug!("duplicate QoS 2 delivery of {:?} dropped", publish.packet_id);
        return State::Ok;
    }
    deliver_message(cx, &publish);
    State::Ok
}

fn deliver_message(cx: &mut LayerCx<'_>, publish: &Publish) {
    let handle = cx.context_handle();
    let taken = cx.session().and_then(|session| {
        let index = session.handler_for(&publish.topic)?;
        let handler = &mut session.handlers[index];
        Some((handler.filter.clone(), handler.callback.take()?))
    });
    let Some((filter, mut callback)) = taken else {
        debug!("no handler for message on {}", publish.topic);
        return;
    };
    let data = SubscriptionData::Message {
        topic: &publish.topic,
        payload: &publish.payload,
        qos: publish.qos,
        retain: publish.retain,
        dup: publish.dup,
    };
    callback(cx.xively(), handle, data, State::Ok);
    if let Some(session) = cx.session() {
        session.restore_handler_callback(&filter, callback);
    }
}
