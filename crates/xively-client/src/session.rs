//! Per-context MQTT session state.
//!
//! Outlives individual connections so a continued session can resend what
//! the broker never acknowledged:
//! - publishes queued while disconnected, in submission order
//! - QoS 1/2 publishes sent but not completely acknowledged, in id order
//! - QoS 2 ids received but not yet released
//! - the sequential subscription queue and the active subscription handlers

use std::collections::VecDeque;

use ahash::AHashSet;
use bytes::Bytes;
use xively_core::{Packet, Publish, QoS};

use crate::dispatcher::TimeEventId;
use crate::events::{PublishCallback, SubscriptionCallback};
use crate::packet_id::PacketIdAllocator;
use crate::topic::topic_matches;

/// A publish waiting for the connection.
pub struct OutboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<u16>,
    pub callback: Option<PublishCallback>,
}

/// Acknowledgment a sent QoS 1/2 publish is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    AwaitingPuback,
    AwaitingPubrec,
    AwaitingPubcomp,
}

/// A sent QoS 1/2 publish.
pub struct PendingPublish {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub stage: PublishStage,
    pub send_count: u32,
    pub retry_event: Option<TimeEventId>,
    pub callback: Option<PublishCallback>,
}

impl PendingPublish {
    pub fn new(outbound: OutboundPublish, packet_id: u16) -> Self {
        let stage = match outbound.qos {
            QoS::ExactlyOnce => PublishStage::AwaitingPubrec,
            _ => PublishStage::AwaitingPuback,
        };
        Self {
            packet_id,
            topic: outbound.topic,
            payload: outbound.payload,
            qos: outbound.qos,
            retain: outbound.retain,
            stage,
            send_count: 1,
            retry_event: None,
            callback: outbound.callback,
        }
    }

    /// The packet to (re)send for the current stage. Resent publishes carry
    /// the DUP flag.
    pub fn packet(&self, dup: bool) -> Packet {
        match self.stage {
            PublishStage::AwaitingPubcomp => Packet::Pubrel {
                packet_id: self.packet_id,
            },
            PublishStage::AwaitingPuback | PublishStage::AwaitingPubrec => {
                Packet::Publish(Publish {
                    dup,
                    qos: self.qos,
                    retain: self.retain,
                    topic: self.topic.clone(),
                    packet_id: Some(self.packet_id),
                    payload: self.payload.clone(),
                })
            }
        }
    }
}

/// A subscription request. The front of the queue is in flight once it has
/// a message id.
pub struct PendingSubscribe {
    pub topic: String,
    pub qos: QoS,
    pub packet_id: Option<u16>,
    pub callback: Option<SubscriptionCallback>,
}

/// An acknowledged subscription.
pub struct SubscriptionHandler {
    pub filter: String,
    pub qos: QoS,
    pub callback: Option<SubscriptionCallback>,
}

/// Session state of one context.
#[derive(Default)]
pub struct Session {
    pub ids: PacketIdAllocator,
    pub outbox: VecDeque<OutboundPublish>,
    pub unacked: VecDeque<PendingPublish>,
    /// Callbacks of QoS 0 publishes handed to the codec, in write order.
    pub awaiting_write: VecDeque<Option<PublishCallback>>,
    pub subscriptions: VecDeque<PendingSubscribe>,
    pub handlers: Vec<SubscriptionHandler>,
    pub inbound_qos2: AHashSet<u16>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes accepted but not yet completed.
    pub fn pubs_in_flight(&self) -> usize {
        self.outbox.len() + self.unacked.len() + self.awaiting_write.len()
    }

    pub fn pending(&self, packet_id: u16) -> Option<&PendingPublish> {
        self.unacked.iter().find(|p| p.packet_id == packet_id)
    }

    pub fn pending_mut(&mut self, packet_id: u16) -> Option<&mut PendingPublish> {
        self.unacked.iter_mut().find(|p| p.packet_id == packet_id)
    }

    /// Remove a completed exchange and free its id.
    pub fn complete(&mut self, packet_id: u16) -> Option<PendingPublish> {
        let pos = self.unacked.iter().position(|p| p.packet_id == packet_id)?;
        self.ids.release(packet_id);
        self.unacked.remove(pos)
    }

    /// Ids waiting for an acknowledgment, in assignment order.
    pub fn unacked_ids(&self) -> Vec<u16> {
        self.unacked.iter().map(|p| p.packet_id).collect()
    }

    /// Record an inbound QoS 2 id. False for a duplicate delivery.
    pub fn receive_qos2(&mut self, packet_id: u16) -> bool {
        self.inbound_qos2.insert(packet_id)
    }

    pub fn release_qos2(&mut self, packet_id: u16) -> bool {
        self.inbound_qos2.remove(&packet_id)
    }

    /// Index of the first handler whose filter matches `topic`.
    pub fn handler_for(&self, topic: &str) -> Option<usize> {
        self.handlers
            .iter()
            .position(|handler| topic_matches(&handler.filter, topic))
    }

    /// Install a handler, replacing one with the same filter.
    pub fn set_handler(&mut self, handler: SubscriptionHandler) {
        match self.handlers.iter_mut().find(|h| h.filter == handler.filter) {
            Some(existing) => *existing = handler,
            None => self.handlers.push(handler),
        }
    }

    /// Put a callback back after it was taken out for a call. Dropped if the
    /// handler was replaced in the meantime.
    pub fn restore_handler_callback(&mut self, filter: &str, callback: SubscriptionCallback) {
        if let Some(handler) = self.handlers.iter_mut().find(|h| h.filter == filter) {
            if handler.callback.is_none() {
                handler.callback = Some(callback);
            }
        }
    }

    /// Whether a SUBSCRIBE is waiting for its SUBACK.
    pub fn subscription_in_flight(&self) -> bool {
        self.subscriptions
            .front()
            .is_some_and(|sub| sub.packet_id.is_some())
    }

    /// Forget per-connection progress so everything pending is resent on
    /// the next connection.
    pub fn rewind(&mut self) {
        for pending in self.unacked.iter_mut() {
            pending.retry_event = None;
        }
        if let Some(front) = self.subscriptions.front_mut() {
            if let Some(id) = front.packet_id.take() {
                self.ids.release(id);
            }
        }
    }

    /// Drop everything a clean session discards, returning the callbacks
    /// of publishes that will never complete.
    pub fn discard_unacked(&mut self) -> Vec<PublishCallback> {
        let mut callbacks = Vec::new();
        for pending in self.unacked.drain(..) {
            self.ids.release(pending.packet_id);
            callbacks.extend(pending.callback);
        }
        callbacks
    }

    /// Callbacks of QoS 0 publishes that were never confirmed written.
    pub fn discard_awaiting_write(&mut self) -> Vec<PublishCallback> {
        self.awaiting_write.drain(..).flatten().collect()
    }

    /// Start a clean session: no handlers and no inbound QoS 2 state.
    pub fn reset_for_clean_start(&mut self) {
        self.handlers.clear();
        self.inbound_qos2.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(qos: QoS) -> OutboundPublish {
        OutboundPublish {
            topic: "test_topic".into(),
            payload: Bytes::from_static(b"0123456789"),
            qos,
            retain: false,
            packet_id: None,
            callback: None,
        }
    }

    #[test]
    fn test_complete_releases_id() {
        let mut session = Session::new();
        let id = session.ids.allocate().unwrap();
        session.unacked.push_back(PendingPublish::new(outbound(QoS::AtLeastOnce), id));
        assert_eq!(session.unacked_ids(), vec![id]);
        assert!(session.complete(id).is_some());
        assert!(session.complete(id).is_none());
        assert!(!session.ids.is_in_use(id));
    }

    #[test]
    fn test_resend_carries_dup() {
        let pending = PendingPublish::new(outbound(QoS::AtLeastOnce), 7);
        match pending.packet(true) {
            Packet::Publish(publish) => {
                assert!(publish.dup);
                assert_eq!(publish.packet_id, Some(7));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_qos2_stage_resends_pubrel() {
        let mut pending = PendingPublish::new(outbound(QoS::ExactlyOnce), 3);
        assert_eq!(pending.stage, PublishStage::AwaitingPubrec);
        pending.stage = PublishStage::AwaitingPubcomp;
        assert_eq!(pending.packet(true), Packet::Pubrel { packet_id: 3 });
    }

    #[test]
    fn test_inbound_qos2_dedup() {
        let mut session = Session::new();
        assert!(session.receive_qos2(5));
        assert!(!session.receive_qos2(5));
        assert!(session.release_qos2(5));
        assert!(!session.release_qos2(5));
    }

    #[test]
    fn test_handler_lookup() {
        let mut session = Session::new();
        session.set_handler(SubscriptionHandler {
            filter: "a/+".into(),
            qos: QoS::AtMostOnce,
            callback: None,
        });
        session.set_handler(SubscriptionHandler {
            filter: "a/+".into(),
            qos: QoS::AtLeastOnce,
            callback: None,
        });
        assert_eq!(session.handlers.len(), 1);
        assert_eq!(session.handlers[0].qos, QoS::AtLeastOnce);
        assert_eq!(session.handler_for("a/b"), Some(0));
        assert_eq!(session.handler_for("b/a"), None);
    }

    #[test]
    fn test_rewind_releases_subscription_id() {
        let mut session = Session::new();
        let id = session.ids.allocate().unwrap();
        session.subscriptions.push_back(PendingSubscribe {
            topic: "t".into(),
            qos: QoS::AtMostOnce,
            packet_id: Some(id),
            callback: None,
        });
        assert!(session.subscription_in_flight());
        session.rewind();
        assert!(!session.subscription_in_flight());
        assert!(!session.ids.is_in_use(id));
    }
}
