//! Full client stack against the mock broker: connect, subscribe, publish
//! at every QoS level, retransmission and connection loss.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{payload, Harness};
use xively_client::{Config, ConnectionState, LastWill, Repeat, SessionType, State, SubscriptionData};
use xively_core::{Packet, PacketType, Publish, QoS, SubackStatus};

type Results = Rc<RefCell<Vec<State>>>;

fn publish_callback(results: &Results) -> Option<xively_client::PublishCallback> {
    let results = results.clone();
    Some(Box::new(move |_xi, _ctx, state| results.borrow_mut().push(state)))
}

fn publish_packet(topic: &str, qos: QoS, packet_id: Option<u16>, data: &'static [u8]) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id,
        payload: payload(data),
    })
}

#[test]
fn test_connect_sends_credentials() {
    let h = Harness::connected(Config::default());
    assert_eq!(h.outcomes(), vec![(ConnectionState::Opened, State::Ok)]);

    let broker = h.broker.borrow();
    match &broker.received[0] {
        Packet::Connect(connect) => {
            assert_eq!(connect.client_id, "device");
            assert_eq!(connect.username.as_deref(), Some("device"));
            assert_eq!(connect.password.as_deref(), Some(&b"secret"[..]));
            assert!(connect.clean_session);
            assert_eq!(connect.keep_alive, xively_client::config::DEFAULT_KEEPALIVE_TIMEOUT);
            assert!(connect.will.is_none());
        }
        other => panic!("expected CONNECT, got {:?}", other),
    }
}

#[test]
fn test_connect_carries_will() {
    let mut h = Harness::new(Config::default());
    let outcomes = h.outcomes.clone();
    let will = LastWill::new("device/status", "offline")
        .qos(QoS::AtLeastOnce)
        .retain(true);
    h.xi.connect_with_lastwill(
        h.ctx,
        will,
        Box::new(move |_xi, _ctx, data, state| outcomes.borrow_mut().push((data.connection_state, state))),
    )
    .unwrap();
    h.tick();

    let broker = h.broker.borrow();
    let Packet::Connect(connect) = &broker.received[0] else {
        panic!("expected CONNECT");
    };
    let will = connect.will.as_ref().unwrap();
    assert_eq!(will.topic, "device/status");
    assert_eq!(&will.message[..], &b"offline"[..]);
    assert_eq!(will.qos, QoS::AtLeastOnce);
    assert!(will.retain);
}

#[test]
fn test_second_connect_is_rejected() {
    let mut h = Harness::connected(Config::default());
    assert_eq!(h.connect(), Err(State::AlreadyInitialized));
}

#[test]
fn test_refused_connection_applies_backoff() {
    let mut h = Harness::new(Config::default());
    h.broker.borrow_mut().connack_code = 5;
    h.connect().unwrap();
    h.tick();

    assert_eq!(
        h.outcomes(),
        vec![(ConnectionState::OpenFailed, State::MqttNotAuthorized)]
    );
    assert!(!h.xi.is_context_connected(h.ctx));
    assert_eq!(h.xi.backoff_status().index(), 1);
    assert_eq!(
        h.xi.publish(h.ctx, "t", "x", QoS::AtLeastOnce, false, None),
        Err(State::BackoffTerminal)
    );
}

#[test]
fn test_transport_failure_is_reported() {
    let mut h = Harness::new(Config::default());
    h.broker.borrow_mut().connect_error = Some(State::SocketConnectionError);
    h.connect().unwrap();
    h.tick();
    assert_eq!(
        h.outcomes(),
        vec![(ConnectionState::OpenFailed, State::SocketConnectionError)]
    );
    assert!(h.broker.borrow().received.is_empty());
    assert_eq!(h.xi.resource_stats().pending_events, 1, "only the backoff decay remains");
}

#[test]
fn test_subscribe_and_receive() {
    let mut h = Harness::connected(Config::default());
    let events: Rc<RefCell<Vec<String>>> = Rc::default();
    let seen = events.clone();
    h.xi.subscribe(
        h.ctx,
        "sensors/+",
        QoS::AtLeastOnce,
        Box::new(move |_xi, _ctx, data, state| {
            let entry = match data {
                SubscriptionData::Suback { topic, status } => format!("suback {} {:?} {:?}", topic, status, state),
                SubscriptionData::Message { topic, payload, qos, .. } => {
                    format!("message {} {:?} {:?}", topic, std::str::from_utf8(payload).unwrap(), qos)
                }
            };
            seen.borrow_mut().push(entry);
        }),
    )
    .unwrap();
    h.tick();
    assert_eq!(
        *events.borrow(),
        vec!["suback sensors/+ Qos1Granted MqttSubscriptionSuccessful".to_string()]
    );

    h.send_to_client(publish_packet("sensors/temp", QoS::AtLeastOnce, Some(7), b"21.5"));
    h.send_to_client(publish_packet("other/temp", QoS::AtMostOnce, None, b"ignored"));
    h.pump(1);
    assert_eq!(events.borrow().len(), 2);
    assert_eq!(events.borrow()[1], "message sensors/temp \"21.5\" AtLeastOnce");
    assert_eq!(
        h.broker.borrow().sent_of(PacketType::Puback),
        vec![&Packet::Puback { packet_id: 7 }]
    );
}

#[test]
fn test_subscriptions_go_out_one_at_a_time() {
    let mut h = Harness::connected(Config::default());
    h.broker.borrow_mut().grant = Some(SubackStatus::Failed);
    let states: Results = Rc::default();
    for filter in ["a", "b", "c"] {
        let states = states.clone();
        h.xi.subscribe(
            h.ctx,
            filter,
            QoS::AtMostOnce,
            Box::new(move |_xi, _ctx, _data, state| states.borrow_mut().push(state)),
        )
        .unwrap();
    }
    h.tick();

    let broker = h.broker.borrow();
    let topics: Vec<String> = broker
        .sent_of(PacketType::Subscribe)
        .into_iter()
        .map(|packet| match packet {
            Packet::Subscribe(subscribe) => subscribe.topics[0].0.clone(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(topics, vec!["a", "b", "c"]);
    assert_eq!(*states.borrow(), vec![State::MqttSubscriptionFailed; 3]);
    assert!(h.xi.context(h.ctx).unwrap().session().handlers.is_empty());
}

#[test]
fn test_qos2_inbound_delivered_once() {
    let mut h = Harness::connected(Config::default());
    let count = Rc::new(RefCell::new(0));
    let counter = count.clone();
    h.xi.subscribe(
        h.ctx,
        "cmd",
        QoS::ExactlyOnce,
        Box::new(move |_xi, _ctx, data, _state| {
            if matches!(data, SubscriptionData::Message { .. }) {
                *counter.borrow_mut() += 1;
            }
        }),
    )
    .unwrap();
    h.tick();

    h.send_to_client(publish_packet("cmd", QoS::ExactlyOnce, Some(3), b"on"));
    h.send_to_client(publish_packet("cmd", QoS::ExactlyOnce, Some(3), b"on"));
    h.pump(1);
    assert_eq!(*count.borrow(), 1);
    let broker = h.broker.borrow();
    assert_eq!(broker.sent_of(PacketType::Pubrec).len(), 2);
    // Both PUBRELs are answered even though the first one released the id.
    assert_eq!(
        broker.sent_of(PacketType::Pubcomp),
        vec![&Packet::Pubcomp { packet_id: 3 }; 2]
    );
}

#[test]
fn test_publish_qos0_completes_on_write() {
    let mut h = Harness::connected(Config::default());
    let results: Results = Rc::default();
    let id = h
        .xi
        .publish(h.ctx, "t", "hello", QoS::AtMostOnce, false, publish_callback(&results))
        .unwrap();
    assert_eq!(id, None);
    h.tick();
    assert_eq!(*results.borrow(), vec![State::Ok]);
    assert_eq!(
        h.broker.borrow().sent_of(PacketType::Publish),
        vec![&publish_packet("t", QoS::AtMostOnce, None, b"hello")]
    );
}

#[test]
fn test_publish_qos1_completes_on_puback() {
    let mut h = Harness::connected(Config::default());
    let results: Results = Rc::default();
    let id = h
        .xi
        .publish(h.ctx, "t", "one", QoS::AtLeastOnce, true, publish_callback(&results))
        .unwrap();
    assert_eq!(id, Some(1));
    h.tick();
    assert_eq!(*results.borrow(), vec![State::Ok]);
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
    let sent = h.broker.borrow().sent_of(PacketType::Publish)[0].clone();
    match sent {
        Packet::Publish(publish) => {
            assert!(publish.retain);
            assert_eq!(publish.packet_id, Some(1));
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_publish_qos2_full_exchange() {
    let mut h = Harness::connected(Config::default());
    let results: Results = Rc::default();
    h.xi.publish(h.ctx, "t", "two", QoS::ExactlyOnce, false, publish_callback(&results))
        .unwrap();
    h.tick();
    assert_eq!(*results.borrow(), vec![State::Ok]);
    let broker = h.broker.borrow();
    let kinds: Vec<PacketType> = broker.received[1..].iter().map(Packet::packet_type).collect();
    assert_eq!(kinds, vec![PacketType::Publish, PacketType::Pubrel]);
}

#[test]
fn test_unacknowledged_publish_is_retried_then_abandoned() {
    let mut config = Config::default();
    config.limits.max_publish_retries = 2;
    let mut h = Harness::connected(config);
    h.broker.borrow_mut().acknowledge = false;
    let results: Results = Rc::default();
    h.xi.publish(h.ctx, "t", "x", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    h.tick();

    let keepalive = i64::from(xively_client::config::DEFAULT_KEEPALIVE_TIMEOUT);
    h.pump(keepalive);
    let dups: Vec<bool> = h
        .broker
        .borrow()
        .sent_of(PacketType::Publish)
        .into_iter()
        .map(|packet| matches!(packet, Packet::Publish(publish) if publish.dup))
        .collect();
    assert_eq!(dups, vec![false, true]);
    assert!(results.borrow().is_empty());

    h.pump(keepalive * 2);
    assert_eq!(h.broker.borrow().sent_of(PacketType::Publish).len(), 3);
    assert_eq!(*results.borrow(), vec![State::Timeout]);
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
}

#[test]
fn test_unknown_acknowledgments_are_ignored() {
    let mut h = Harness::connected(Config::default());
    h.send_to_client(Packet::Puback { packet_id: 99 });
    h.send_to_client(Packet::Pubcomp { packet_id: 98 });
    h.pump(1);
    assert!(h.xi.is_context_connected(h.ctx));
    assert_eq!(h.outcomes().len(), 1);
}

#[test]
fn test_keepalive_pings() {
    let mut h = Harness::connected(Config::default());
    let keepalive = i64::from(xively_client::config::DEFAULT_KEEPALIVE_TIMEOUT);
    h.pump(keepalive * 3);
    assert_eq!(h.broker.borrow().sent_of(PacketType::Pingreq).len(), 3);
    assert!(h.xi.is_context_connected(h.ctx));
}

#[test]
fn test_graceful_shutdown() {
    let mut h = Harness::connected(Config::default());
    h.xi.shutdown_connection(h.ctx).unwrap();
    h.tick();

    assert_eq!(h.broker.borrow().received.last(), Some(&Packet::Disconnect));
    assert_eq!(
        h.outcomes(),
        vec![
            (ConnectionState::Opened, State::Ok),
            (ConnectionState::Closed, State::Ok)
        ]
    );
    assert!(!h.xi.is_context_connected(h.ctx));
    let stats = h.xi.resource_stats();
    assert_eq!(stats.pending_events, 0);
    assert_eq!(stats.registered_fds, 0);
    assert_eq!(h.xi.shutdown_connection(h.ctx), Err(State::NotInitialized));
}

#[test]
fn test_queued_publishes_go_out_after_connect() {
    let mut h = Harness::new(Config::default());
    let results: Results = Rc::default();
    let first = h
        .xi
        .publish(h.ctx, "t", "1", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    let second = h
        .xi
        .publish(h.ctx, "t", "2", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    assert_eq!((first, second), (Some(1), Some(2)));
    assert_eq!(h.xi.pending_message_ids(h.ctx).unwrap(), vec![1, 2]);

    h.connect().unwrap();
    h.tick();
    assert_eq!(*results.borrow(), vec![State::Ok, State::Ok]);
    let ids: Vec<Option<u16>> = h
        .broker
        .borrow()
        .sent_of(PacketType::Publish)
        .into_iter()
        .map(Packet::packet_id)
        .collect();
    assert_eq!(ids, vec![Some(1), Some(2)]);
}

#[test]
fn test_continued_session_resends_after_loss() {
    let mut config = Config::default();
    config.connection.session = SessionType::Continue;
    config.connection.auto_reconnect = true;
    let mut h = Harness::connected(config);
    h.broker.borrow_mut().acknowledge = false;
    let results: Results = Rc::default();
    h.xi.publish(h.ctx, "t", "kept", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    h.tick();

    h.broker.borrow_mut().drop_connection = true;
    h.broker.borrow_mut().acknowledge = true;
    h.pump(1);
    assert_eq!(
        h.outcomes()[1],
        (ConnectionState::Closed, State::ConnectionResetByPeer)
    );
    assert!(results.borrow().is_empty());
    assert_eq!(h.xi.pending_message_ids(h.ctx).unwrap(), vec![1]);

    h.pump(6);
    assert_eq!(h.broker.borrow().connections, 2);
    assert!(h.xi.is_context_connected(h.ctx));
    assert_eq!(*results.borrow(), vec![State::Ok]);
    let publishes = h.broker.borrow().sent_of(PacketType::Publish).len();
    assert_eq!(publishes, 2);
}

#[test]
fn test_clean_session_fails_unacknowledged_on_loss() {
    let mut h = Harness::connected(Config::default());
    h.broker.borrow_mut().acknowledge = false;
    let results: Results = Rc::default();
    h.xi.publish(h.ctx, "t", "lost", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    h.tick();

    h.broker.borrow_mut().drop_connection = true;
    h.pump(1);
    assert_eq!(*results.borrow(), vec![State::ConnectionResetByPeer]);
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
}

#[test]
fn test_delete_context_releases_everything() {
    let mut h = Harness::connected(Config::default());
    h.xi.schedule_timed_task(h.ctx, Box::new(|_, _, _| {}), 5, xively_client::Repeat::Forever)
        .unwrap();
    h.xi.delete_context(h.ctx).unwrap();
    let stats = h.xi.resource_stats();
    assert_eq!(stats.contexts, 0);
    assert_eq!(stats.timed_tasks, 0);
    assert_eq!(stats.pending_events, 0);
    assert_eq!(h.xi.delete_context(h.ctx), Err(State::NullContext));
}

#[test]
fn test_message_id_stays_pending_until_puback() {
    let mut h = Harness::connected(Config::default());
    h.broker.borrow_mut().acknowledge = false;
    let id = h
        .xi
        .publish(h.ctx, "test_topic", "0123456789", QoS::AtLeastOnce, false, None)
        .unwrap()
        .unwrap();
    h.tick();

    match h.broker.borrow().sent_of(PacketType::Publish)[0] {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "test_topic");
            assert_eq!(&publish.payload[..], b"0123456789");
            assert_eq!(publish.packet_id, Some(id));
        }
        _ => unreachable!(),
    }
    assert_eq!(h.xi.pending_message_ids(h.ctx).unwrap(), vec![id]);

    h.send_to_client(Packet::Puback { packet_id: id });
    h.pump(1);
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
}

#[test]
fn test_requests_are_withdrawn_when_the_event_queue_is_full() {
    let mut config = Config::default();
    config.limits.max_events = 16;
    config.limits.max_timed_tasks = 64;
    let mut h = Harness::connected(config);

    let mut tasks = Vec::new();
    loop {
        match h.xi.schedule_timed_task(h.ctx, Box::new(|_, _, _| {}), 1000, Repeat::Once) {
            Ok(task) => tasks.push(task),
            Err(err) => {
                assert_eq!(err, State::NoMoreResourceAvailable);
                break;
            }
        }
    }

    let results: Results = Rc::default();
    let published = h.xi.publish(
        h.ctx,
        "test_topic",
        "0123456789",
        QoS::AtLeastOnce,
        false,
        publish_callback(&results),
    );
    assert_eq!(published, Err(State::NoMoreResourceAvailable));
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
    let subscribed = h.xi.subscribe(h.ctx, "cmd/#", QoS::AtLeastOnce, Box::new(|_, _, _, _| {}));
    assert_eq!(subscribed, Err(State::NoMoreResourceAvailable));

    for task in tasks {
        h.xi.cancel_timed_task(task).unwrap();
    }
    h.xi.publish(h.ctx, "test_topic", "retry", QoS::AtLeastOnce, false, publish_callback(&results))
        .unwrap();
    h.tick();

    let broker = h.broker.borrow();
    let sent = broker.sent_of(PacketType::Publish);
    assert_eq!(sent.len(), 1);
    let Packet::Publish(publish) = sent[0] else {
        panic!("expected PUBLISH");
    };
    assert_eq!(&publish.payload[..], b"retry");
    assert!(broker.sent_of(PacketType::Subscribe).is_empty());
    drop(broker);
    assert_eq!(*results.borrow(), vec![State::Ok]);
    assert!(h.xi.pending_message_ids(h.ctx).unwrap().is_empty());
}
