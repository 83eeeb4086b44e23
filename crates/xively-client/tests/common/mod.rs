//! Shared helpers for integration tests: a scripted in-memory broker that
//! replaces the socket at the bottom of the layer chain.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::SeedableRng;
use xively_client::dispatcher::TimeEventId;
use xively_client::layer::is_write_completion;
use xively_client::{
    Config, ConnectionState, ContextHandle, Layer, LayerCx, LayerData, LayerOp, ManualClock, State,
    Xively,
};
use xively_core::serialiser::encode_to_bytes;
use xively_core::{decode_packet, Connack, Packet, PacketType, QoS, Suback, SubackStatus};

/// What the broker saw and how it answers.
#[derive(Debug)]
pub struct BrokerState {
    /// Packets written by the client, in order.
    pub received: Vec<Packet>,
    /// Packets waiting to be delivered to the client.
    pub to_client: VecDeque<Packet>,
    pub connack_code: u8,
    /// Transport failure reported instead of connecting.
    pub connect_error: Option<State>,
    /// Answer publishes with PUBACK/PUBREC and PUBREL with PUBCOMP.
    pub acknowledge: bool,
    /// Overrides the granted QoS of every SUBACK.
    pub grant: Option<SubackStatus>,
    /// Drop the connection on the next poll.
    pub drop_connection: bool,
    pub connections: u32,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            to_client: VecDeque::new(),
            connack_code: 0,
            connect_error: None,
            acknowledge: true,
            grant: None,
            drop_connection: false,
            connections: 0,
        }
    }
}

impl BrokerState {
    fn answer(&mut self, packet: &Packet) -> Vec<Packet> {
        match packet {
            Packet::Connect(_) => vec![Packet::Connack(Connack {
                session_present: false,
                return_code: self.connack_code,
            })],
            Packet::Subscribe(subscribe) => vec![Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes: subscribe
                    .topics
                    .iter()
                    .map(|(_, qos)| self.grant.unwrap_or(granted(*qos)))
                    .collect(),
            })],
            Packet::Publish(publish) if self.acknowledge => match (publish.qos, publish.packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => vec![Packet::Puback { packet_id }],
                (QoS::ExactlyOnce, Some(packet_id)) => vec![Packet::Pubrec { packet_id }],
                _ => Vec::new(),
            },
            Packet::Pubrel { packet_id } if self.acknowledge => vec![Packet::Pubcomp {
                packet_id: *packet_id,
            }],
            // Second step of a QoS 2 delivery to the client.
            Packet::Pubrec { packet_id } => vec![Packet::Pubrel {
                packet_id: *packet_id,
            }],
            Packet::Pingreq => vec![Packet::Pingresp],
            _ => Vec::new(),
        }
    }

    /// Packets of one type the client wrote.
    pub fn sent_of(&self, kind: PacketType) -> Vec<&Packet> {
        self.received
            .iter()
            .filter(|packet| packet.packet_type() == kind)
            .collect()
    }
}

fn granted(qos: QoS) -> SubackStatus {
    match qos {
        QoS::AtMostOnce => SubackStatus::Qos0Granted,
        QoS::AtLeastOnce => SubackStatus::Qos1Granted,
        QoS::ExactlyOnce => SubackStatus::Qos2Granted,
    }
}

pub type Broker = Rc<RefCell<BrokerState>>;

/// Bottom layer talking to a [`BrokerState`]. Queued packets are delivered
/// on a one second poll.
pub struct MockTransport {
    broker: Broker,
    poll: Option<TimeEventId>,
}

impl MockTransport {
    pub fn new(broker: Broker) -> Self {
        Self { broker, poll: None }
    }

    fn deliver(&self, cx: &mut LayerCx<'_>, packet: &Packet) {
        match encode_to_bytes(packet) {
            Ok(bytes) => {
                cx.schedule_next(LayerOp::Pull, LayerData::Raw(bytes), State::Ok);
            }
            Err(err) => panic!("mock broker cannot encode {:?}: {}", packet, err),
        }
    }

    fn arm(&mut self, cx: &mut LayerCx<'_>) -> State {
        match cx.schedule_this_in(1, LayerOp::Pull, LayerData::Empty, State::Ok) {
            Ok(id) => {
                self.poll = Some(id);
                State::Ok
            }
            Err(err) => err,
        }
    }
}

impl Layer for MockTransport {
    fn init(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        let result = {
            let mut broker = self.broker.borrow_mut();
            broker.connections += 1;
            broker.drop_connection = false;
            broker.connect_error.unwrap_or(state)
        };
        if result == State::Ok {
            let armed = self.arm(cx);
            if armed != State::Ok {
                return armed;
            }
        }
        cx.schedule_next(LayerOp::Connect, LayerData::Empty, result)
    }

    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if is_write_completion(state) {
            return State::Ok;
        }
        let wire = match data {
            LayerData::Frame { header, payload } => {
                let mut wire = BytesMut::from(&header[..]);
                wire.extend_from_slice(&payload);
                wire.freeze()
            }
            LayerData::Raw(bytes) => bytes,
            _ => return State::Ok,
        };
        let packet = match decode_packet(&wire, 0) {
            Ok(Some((packet, consumed))) if consumed == wire.len() => packet,
            other => panic!("client wrote an invalid frame: {:?}", other.map(|o| o.map(|(p, _)| p))),
        };
        cx.schedule_next(LayerOp::Push, LayerData::Empty, State::Written);

        let replies = {
            let mut broker = self.broker.borrow_mut();
            let replies = broker.answer(&packet);
            broker.received.push(packet);
            replies
        };
        for reply in &replies {
            self.deliver(cx, reply);
        }
        State::Ok
    }

    /// Poll timer.
    fn pull(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, _state: State) -> State {
        self.poll = None;
        let (pending, dropped): (Vec<Packet>, bool) = {
            let mut broker = self.broker.borrow_mut();
            (broker.to_client.drain(..).collect(), broker.drop_connection)
        };
        if dropped {
            return cx.close_chain(State::ConnectionResetByPeer);
        }
        for packet in &pending {
            self.deliver(cx, packet);
        }
        self.arm(cx)
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, _data: LayerData, state: State) -> State {
        if let Some(id) = self.poll.take() {
            cx.cancel_timeout(id);
        }
        cx.schedule_next(LayerOp::CloseExternally, LayerData::Empty, state)
    }
}

/// Connection callback outcomes, in order.
pub type Outcomes = Rc<RefCell<Vec<(ConnectionState, State)>>>;

/// A client with one context wired to a mock broker.
pub struct Harness {
    pub xi: Xively,
    pub clock: ManualClock,
    pub broker: Broker,
    pub ctx: ContextHandle,
    pub outcomes: Outcomes,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = ManualClock::new(0);
        let mut xi = Xively::initialize("account", "device")
            .unwrap()
            .with_config(config)
            .with_password("secret")
            .with_clock(Box::new(clock.clone()))
            .with_rng(Box::new(StdRng::seed_from_u64(11)));
        let broker = Broker::default();
        let transport_broker = broker.clone();
        let ctx = xi
            .create_context_with_transport(Box::new(move || {
                Box::new(MockTransport::new(transport_broker.clone())) as Box<dyn Layer>
            }))
            .unwrap();
        Self {
            xi,
            clock,
            broker,
            ctx,
            outcomes: Outcomes::default(),
        }
    }

    /// Start connecting and record every connection callback.
    pub fn connect(&mut self) -> xively_client::Result<()> {
        let outcomes = self.outcomes.clone();
        self.xi.connect(
            self.ctx,
            Box::new(move |_xi, _ctx, data, state| {
                outcomes.borrow_mut().push((data.connection_state, state));
            }),
        )
    }

    /// Connect and run until the CONNACK was handled.
    pub fn connected(config: Config) -> Self {
        let mut harness = Self::new(config);
        harness.connect().unwrap();
        harness.tick();
        assert!(harness.xi.is_context_connected(harness.ctx));
        harness
    }

    /// Run everything due now.
    pub fn tick(&mut self) {
        assert_eq!(self.xi.events_process_tick(), State::Ok);
    }

    /// Let `seconds` pass one second at a time.
    pub fn pump(&mut self, seconds: i64) {
        for _ in 0..seconds {
            self.clock.advance(1);
            self.tick();
        }
    }

    pub fn outcomes(&self) -> Vec<(ConnectionState, State)> {
        self.outcomes.borrow().clone()
    }

    /// Queue a packet for the client, delivered on the next poll.
    pub fn send_to_client(&self, packet: Packet) {
        self.broker.borrow_mut().to_client.push_back(packet);
    }
}

pub fn payload(data: &'static [u8]) -> Bytes {
    Bytes::from_static(data)
}
