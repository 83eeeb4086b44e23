//! MQTT codec layer: packets down, bytes up.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use log::{error, trace};
use xively_core::{decode_packet, serialiser_size, serialiser_write, Packet, PacketType};

use super::{is_write_completion, Layer, LayerCx, LayerData, LayerOp};
use crate::state::State;

const READ_BUFFER_SIZE: usize = 4096;

/// Encodes outgoing packets into frames and decodes the inbound stream.
pub struct CodecLayer {
    read_buf: BytesMut,
    /// Packets handed down, awaiting their write completion.
    in_flight: VecDeque<(PacketType, Option<u16>)>,
    max_payload_size: usize,
    max_packet_size: usize,
}

impl CodecLayer {
    pub fn new(max_payload_size: usize, max_packet_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            in_flight: VecDeque::new(),
            max_payload_size,
            max_packet_size,
        }
    }

    fn encode(&self, packet: &Packet) -> Result<(Bytes, Bytes), State> {
        if let Packet::Publish(publish) = packet {
            if publish.payload.len() > self.max_payload_size {
                return Err(State::MqttPayloadSizeTooLarge);
            }
        }
        let size = serialiser_size(packet)?;
        let mut header = Vec::with_capacity(size.message_len - size.payload_size);
        serialiser_write(packet, &mut header, &size)?;
        let payload = match packet {
            Packet::Publish(publish) => publish.payload.clone(),
            _ => Bytes::new(),
        };
        Ok((Bytes::from(header), payload))
    }
}

impl Layer for CodecLayer {
    fn push(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if is_write_completion(state) {
            let Some((kind, packet_id)) = self.in_flight.pop_front() else {
                trace!("write completion without a packet in flight");
                return State::Ok;
            };
            return cx.schedule_next(LayerOp::Push, LayerData::Sent { kind, packet_id }, state);
        }

        let LayerData::Packet(packet) = data else {
            error!("codec layer expects packets from above");
            return State::InternalError;
        };
        let kind = packet.packet_type();
        let packet_id = packet.packet_id();
        match self.encode(&packet) {
            Ok((header, payload)) => {
                trace!("encoded {:?} ({} + {} bytes)", kind, header.len(), payload.len());
                self.in_flight.push_back((kind, packet_id));
                cx.schedule_prev(LayerOp::Push, LayerData::Frame { header, payload }, State::Ok)
            }
            Err(err) => {
                error!("failed to encode {:?}: {}", kind, err);
                cx.schedule_next(LayerOp::Push, LayerData::Sent { kind, packet_id }, err)
            }
        }
    }

    fn pull(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        if state != State::Ok {
            return cx.schedule_next(LayerOp::Pull, data, state);
        }
        let LayerData::Raw(bytes) = data else {
            return State::Ok;
        };
        self.read_buf.extend_from_slice(&bytes);

        loop {
            match decode_packet(&self.read_buf, self.max_packet_size) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    trace!("decoded {:?}", packet.packet_type());
                    let result = cx.schedule_next(LayerOp::Pull, LayerData::Packet(Box::new(packet)), State::Ok);
                    if result != State::Ok {
                        return result;
                    }
                }
                Ok(None) => return State::Ok,
                Err(err) => {
                    error!("malformed packet from broker: {}", err);
                    self.read_buf.clear();
                    return cx.close_chain(State::MqttParserError);
                }
            }
        }
    }

    fn close(&mut self, cx: &mut LayerCx<'_>, data: LayerData, state: State) -> State {
        self.read_buf.clear();
        self.in_flight.clear();
        cx.schedule_prev(LayerOp::Close, data, state)
    }
}
