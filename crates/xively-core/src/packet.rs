//! MQTT 3.1.1 packet model and decoder.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    /// Map a raw return code. Unknown codes yield `None` and are left for the
    /// caller to report.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnackCode::Accepted),
            1 => Some(ConnackCode::UnacceptableProtocolVersion),
            2 => Some(ConnackCode::IdentifierRejected),
            3 => Some(ConnackCode::ServerUnavailable),
            4 => Some(ConnackCode::BadUsernamePassword),
            5 => Some(ConnackCode::NotAuthorized),
            _ => None,
        }
    }
}

/// Per-topic SUBACK status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubackStatus {
    Qos0Granted = 0x00,
    Qos1Granted = 0x01,
    Qos2Granted = 0x02,
    Failed = 0x80,
}

impl SubackStatus {
    /// Granted QoS, or `None` for a refused subscription.
    pub fn granted_qos(self) -> Option<QoS> {
        match self {
            SubackStatus::Qos0Granted => Some(QoS::AtMostOnce),
            SubackStatus::Qos1Granted => Some(QoS::AtLeastOnce),
            SubackStatus::Qos2Granted => Some(QoS::ExactlyOnce),
            SubackStatus::Failed => None,
        }
    }
}

/// Map a SUBACK payload byte to its status.
///
/// `0x00`, `0x01` and `0x02` are granted QoS levels, `0x80` is a refusal and
/// anything else is a malformed SUBACK.
pub fn parse_suback_response(byte: u8) -> Result<SubackStatus> {
    match byte {
        0x00 => Ok(SubackStatus::Qos0Granted),
        0x01 => Ok(SubackStatus::Qos1Granted),
        0x02 => Ok(SubackStatus::Qos2Granted),
        0x80 => Ok(SubackStatus::Failed),
        _ => Err(ProtocolError::InvalidSubackCode(byte).into()),
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Message id carried by the packet, if its type has one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id,
            Packet::Puback { packet_id }
            | Packet::Pubrec { packet_id }
            | Packet::Pubrel { packet_id }
            | Packet::Pubcomp { packet_id }
            | Packet::Unsuback { packet_id } => Some(*packet_id),
            Packet::Subscribe(subscribe) => Some(subscribe.packet_id),
            Packet::Suback(suback) => Some(suback.packet_id),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            _ => None,
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data. The return code is kept raw so that unknown codes
/// survive decoding and can be reported precisely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: u8,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<SubackStatus>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Cursor over the variable header and payload of one packet.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 }.into());
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            }
            .into());
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            }
            .into());
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            )
            .into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }

    fn finish(&self, packet_type: PacketType) -> Result<()> {
        if self.remaining() != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{:?} has {} trailing bytes",
                packet_type,
                self.remaining()
            ))
            .into());
        }
        Ok(())
    }
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` if a whole packet is
/// available, `Ok(None)` if more bytes are needed, or an error for malformed
/// input. `max_packet_size` of 0 disables the size check.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if max_packet_size > 0 && total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        }
        .into());
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let body = &buf[header_len..total_len];

    // SUBSCRIBE, UNSUBSCRIBE and PUBREL carry fixed flags 0010, the other
    // non-PUBLISH types carry 0000.
    let expected_flags = match packet_type {
        PacketType::Publish => flags,
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => 0x02,
        _ => 0x00,
    };
    if flags != expected_flags {
        return Err(ProtocolError::MalformedPacket(format!(
            "{:?} fixed header flags must be {:#04x}, got {:#04x}",
            packet_type, expected_flags, flags
        ))
        .into());
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id(packet_type, body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id(packet_type, body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id(packet_type, body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id(packet_type, body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_packet_id(packet_type, body)?,
        },
        PacketType::Pingreq => decode_empty(packet_type, body, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(packet_type, body, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(packet_type, body, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_empty(packet_type: PacketType, body: &[u8], packet: Packet) -> Result<Packet> {
    Decoder::new(body).finish(packet_type)?;
    Ok(packet)
}

fn decode_packet_id(packet_type: PacketType, body: &[u8]) -> Result<u16> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;
    dec.finish(packet_type)?;
    Ok(packet_id)
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::InvalidProtocolName(protocol_name).into());
    }

    let protocol_version = dec.read_u8()?;
    if protocol_version != PROTOCOL_LEVEL {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version).into());
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }
    if !username_flag && password_flag {
        return Err(ProtocolError::InvalidConnectFlags(flags).into());
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        let message = Bytes::from(dec.read_binary()?);
        Some(Will {
            topic,
            message,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    dec.finish(PacketType::Connect)?;

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    if (ack_flags & 0xFE) != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "CONNACK reserved flags set: {:#04x}",
            ack_flags
        ))
        .into());
    }
    let return_code = dec.read_u8()?;
    dec.finish(PacketType::Connack)?;

    Ok(Packet::Connack(Connack {
        session_present: (ack_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    let mut dec = Decoder::new(body);

    let topic = dec.read_string()?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        let qos = QoS::try_from(dec.read_u8()?)?;
        topics.push((topic, qos));
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, topics }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut return_codes = Vec::with_capacity(dec.remaining());
    while dec.remaining() > 0 {
        return_codes.push(parse_suback_response(dec.read_u8()?)?);
    }

    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket("SUBACK with no return codes".into()).into());
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut topics = Vec::new();
    while dec.remaining() > 0 {
        let topic = dec.read_string()?;
        if topic.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            )
            .into());
        }
        topics.push(topic);
    }

    if topics.is_empty() {
        return Err(ProtocolError::MalformedPacket("UNSUBSCRIBE with no topics".into()).into());
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, topics }))
}

/// Check a topic name used for PUBLISH: non-empty, no wildcards, no NUL.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::MalformedPacket("Topic name must not be empty".into()).into());
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(ProtocolError::MalformedPacket(format!(
            "Topic name contains a reserved character: {}",
            topic
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_parse_suback_response_mapping() {
        assert_eq!(parse_suback_response(0x00).unwrap(), SubackStatus::Qos0Granted);
        assert_eq!(parse_suback_response(0x01).unwrap(), SubackStatus::Qos1Granted);
        assert_eq!(parse_suback_response(0x02).unwrap(), SubackStatus::Qos2Granted);
        assert_eq!(parse_suback_response(0x80).unwrap(), SubackStatus::Failed);
    }

    #[test]
    fn test_parse_suback_response_rejects_everything_else() {
        for byte in 0u8..=0xFF {
            if matches!(byte, 0x00 | 0x01 | 0x02 | 0x80) {
                continue;
            }
            assert_eq!(
                parse_suback_response(byte),
                Err(Error::Protocol(ProtocolError::InvalidSubackCode(byte)))
            );
        }
    }

    #[test]
    fn test_decode_connack() {
        let (packet, consumed) = decode_packet(&[0x20, 0x02, 0x01, 0x05], 0).unwrap().unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(
            packet,
            Packet::Connack(Connack {
                session_present: true,
                return_code: 5
            })
        );
    }

    #[test]
    fn test_decode_connack_keeps_unknown_code() {
        let (packet, _) = decode_packet(&[0x20, 0x02, 0x00, 0x42], 0).unwrap().unwrap();
        let Packet::Connack(connack) = packet else {
            panic!("expected CONNACK");
        };
        assert_eq!(connack.return_code, 0x42);
        assert_eq!(ConnackCode::from_u8(connack.return_code), None);
    }

    #[test]
    fn test_decode_publish_qos1() {
        let mut buf = vec![0x32, 0x0F, 0x00, 0x05];
        buf.extend_from_slice(b"a/b/c");
        buf.extend_from_slice(&[0x00, 0x07]);
        buf.extend_from_slice(&b"payload"[..6]);
        let (packet, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.topic, "a/b/c");
        assert_eq!(publish.packet_id, Some(7));
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.payload.as_ref(), b"payloa");
    }

    #[test]
    fn test_decode_incomplete_returns_none() {
        assert_eq!(decode_packet(&[], 0).unwrap(), None);
        assert_eq!(decode_packet(&[0x90], 0).unwrap(), None);
        assert_eq!(decode_packet(&[0x90, 0x03, 0x00, 0x01], 0).unwrap(), None);
    }

    #[test]
    fn test_decode_suback_with_failure() {
        let buf = [0x90, 0x04, 0x00, 0x0A, 0x01, 0x80];
        let (packet, _) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::Suback(Suback {
                packet_id: 10,
                return_codes: vec![SubackStatus::Qos1Granted, SubackStatus::Failed],
            })
        );
    }

    #[test]
    fn test_decode_suback_bad_code_is_error() {
        let buf = [0x90, 0x03, 0x00, 0x0A, 0x03];
        assert!(decode_packet(&buf, 0).is_err());
    }

    #[test]
    fn test_decode_over_long_remaining_length() {
        let buf = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            decode_packet(&buf, 0),
            Err(Error::Protocol(ProtocolError::InvalidRemainingLength))
        );
    }

    #[test]
    fn test_decode_rejects_bad_fixed_flags() {
        // PUBREL must carry flags 0010
        assert!(decode_packet(&[0x60, 0x02, 0x00, 0x01], 0).is_err());
        assert!(decode_packet(&[0x62, 0x02, 0x00, 0x01], 0).is_ok());
        // PINGRESP with flags set
        assert!(decode_packet(&[0xD1, 0x00], 0).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert_eq!(
            decode_packet(&[0xF0, 0x00], 0),
            Err(Error::Protocol(ProtocolError::InvalidPacketType(15)))
        );
        assert!(decode_packet(&[0x00, 0x00], 0).is_err());
    }

    #[test]
    fn test_decode_respects_max_packet_size() {
        let buf = [0x30, 0x7F];
        assert!(matches!(
            decode_packet(&buf, 64),
            Err(Error::Protocol(ProtocolError::PacketTooLarge { .. }))
        ));
    }

    #[test]
    fn test_decode_two_packets_back_to_back() {
        let buf = [0xD0, 0x00, 0x40, 0x02, 0x00, 0x09];
        let (first, used) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(first, Packet::Pingresp);
        let (second, _) = decode_packet(&buf[used..], 0).unwrap().unwrap();
        assert_eq!(second, Packet::Puback { packet_id: 9 });
    }

    #[test]
    fn test_packet_ids() {
        assert_eq!(Packet::Pubrel { packet_id: 3 }.packet_id(), Some(3));
        assert_eq!(Packet::Pingreq.packet_id(), None);
        assert_eq!(Packet::Pingreq.packet_type(), PacketType::Pingreq);
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("xi/blue/v1/a/d/b/temp").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+/b").is_err());
        assert!(validate_topic_name("a/#").is_err());
    }
}
