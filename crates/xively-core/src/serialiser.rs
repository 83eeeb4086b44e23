//! Packet serialisation.
//!
//! Sizing and writing are split so the caller can size its buffer exactly
//! before producing any bytes. `serialiser_write` emits everything except the
//! application payload of a PUBLISH, which the caller sends straight from its
//! own buffer.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::packet::{Connect, Packet, PacketType, Publish, QoS, Subscribe, Suback, Unsubscribe};
use crate::packet::{PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::varint::{self, MAX_REMAINING_LENGTH};

/// Largest PUBLISH payload the codec accepts (128 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024;

/// Exact wire size of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializedSize {
    /// Fixed header plus remaining length.
    pub message_len: usize,
    /// Value of the remaining-length field.
    pub remaining_len: usize,
    /// Bytes of the payload section (application data for PUBLISH).
    pub payload_size: usize,
}

/// Compute the wire size of `packet` without writing anything.
pub fn serialiser_size(packet: &Packet) -> Result<SerializedSize> {
    let (variable_header, payload_size) = match packet {
        Packet::Connect(connect) => (10, connect_payload_len(connect)?),
        Packet::Connack(_) => (2, 0),
        Packet::Publish(publish) => {
            if publish.payload.len() > MAX_PAYLOAD_SIZE {
                return Err(Error::PayloadTooLarge {
                    size: publish.payload.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            let id_len = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
            (string_len(&publish.topic)? + id_len, publish.payload.len())
        }
        Packet::Puback { .. }
        | Packet::Pubrec { .. }
        | Packet::Pubrel { .. }
        | Packet::Pubcomp { .. }
        | Packet::Unsuback { .. } => (2, 0),
        Packet::Subscribe(subscribe) => (2, subscribe_payload_len(subscribe)?),
        Packet::Suback(suback) => (2, suback.return_codes.len()),
        Packet::Unsubscribe(unsubscribe) => (2, unsubscribe_payload_len(unsubscribe)?),
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => (0, 0),
    };

    let remaining_len = variable_header + payload_size;
    if remaining_len > MAX_REMAINING_LENGTH {
        return Err(Error::Serialisation("remaining length"));
    }

    Ok(SerializedSize {
        message_len: 1 + varint::encoded_len(remaining_len) + remaining_len,
        remaining_len,
        payload_size,
    })
}

/// Write the fixed header, variable header and every payload field except
/// the application data of a PUBLISH.
pub fn serialiser_write(packet: &Packet, buf: &mut Vec<u8>, size: &SerializedSize) -> Result<()> {
    buf.reserve(size.message_len);
    buf.push(fixed_header_byte(packet)?);
    varint::encode_to_vec(size.remaining_len, buf);

    match packet {
        Packet::Connect(connect) => write_connect(connect, buf),
        Packet::Connack(connack) => {
            buf.push(u8::from(connack.session_present));
            buf.push(connack.return_code);
        }
        Packet::Publish(publish) => write_publish_header(publish, buf)?,
        Packet::Puback { packet_id }
        | Packet::Pubrec { packet_id }
        | Packet::Pubrel { packet_id }
        | Packet::Pubcomp { packet_id }
        | Packet::Unsuback { packet_id } => buf.extend_from_slice(&packet_id.to_be_bytes()),
        Packet::Subscribe(subscribe) => write_subscribe(subscribe, buf),
        Packet::Suback(suback) => write_suback(suback, buf),
        Packet::Unsubscribe(unsubscribe) => write_unsubscribe(unsubscribe, buf),
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
    }

    Ok(())
}

/// Serialise a complete packet, payload included.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    let size = serialiser_size(packet)?;
    serialiser_write(packet, buf, &size)?;
    if let Packet::Publish(publish) = packet {
        buf.extend_from_slice(&publish.payload);
    }
    Ok(())
}

/// Serialise a complete packet into a fresh buffer.
pub fn encode_to_bytes(packet: &Packet) -> Result<Bytes> {
    let mut buf = Vec::new();
    encode_packet(packet, &mut buf)?;
    Ok(Bytes::from(buf))
}

fn fixed_header_byte(packet: &Packet) -> Result<u8> {
    let packet_type = packet.packet_type();
    let flags = match packet {
        Packet::Publish(publish) => {
            if publish.qos != QoS::AtMostOnce && publish.packet_id.is_none() {
                return Err(Error::Serialisation("PUBLISH without packet id"));
            }
            (u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain)
        }
        _ if matches!(
            packet_type,
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe
        ) =>
        {
            0x02
        }
        _ => 0x00,
    };
    Ok(((packet_type as u8) << 4) | flags)
}

fn string_len(value: &str) -> Result<usize> {
    binary_len(value.as_bytes())
}

fn binary_len(value: &[u8]) -> Result<usize> {
    if value.len() > u16::MAX as usize {
        return Err(Error::Serialisation("string longer than 65535 bytes"));
    }
    Ok(2 + value.len())
}

fn connect_payload_len(connect: &Connect) -> Result<usize> {
    let mut len = string_len(&connect.client_id)?;
    if let Some(will) = &connect.will {
        len += string_len(&will.topic)? + binary_len(&will.message)?;
    }
    if let Some(username) = &connect.username {
        len += string_len(username)?;
    }
    if let Some(password) = &connect.password {
        if connect.username.is_none() {
            return Err(Error::Serialisation("password without username"));
        }
        len += binary_len(password)?;
    }
    Ok(len)
}

fn subscribe_payload_len(subscribe: &Subscribe) -> Result<usize> {
    if subscribe.topics.is_empty() {
        return Err(Error::Serialisation("SUBSCRIBE without topics"));
    }
    subscribe
        .topics
        .iter()
        .try_fold(0, |acc, (topic, _)| Ok(acc + string_len(topic)? + 1))
}

fn unsubscribe_payload_len(unsubscribe: &Unsubscribe) -> Result<usize> {
    if unsubscribe.topics.is_empty() {
        return Err(Error::Serialisation("UNSUBSCRIBE without topics"));
    }
    unsubscribe
        .topics
        .iter()
        .try_fold(0, |acc, topic| Ok(acc + string_len(topic)?))
}

fn write_string(value: &str, buf: &mut Vec<u8>) {
    write_binary(value.as_bytes(), buf);
}

fn write_binary(value: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn write_connect(connect: &Connect, buf: &mut Vec<u8>) {
    write_string(PROTOCOL_NAME, buf);
    buf.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    buf.push(flags);
    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());

    write_string(&connect.client_id, buf);
    if let Some(will) = &connect.will {
        write_string(&will.topic, buf);
        write_binary(&will.message, buf);
    }
    if let Some(username) = &connect.username {
        write_string(username, buf);
    }
    if let Some(password) = &connect.password {
        write_binary(password, buf);
    }
}

fn write_publish_header(publish: &Publish, buf: &mut Vec<u8>) -> Result<()> {
    write_string(&publish.topic, buf);
    if publish.qos != QoS::AtMostOnce {
        let packet_id = publish
            .packet_id
            .ok_or(Error::Serialisation("PUBLISH without packet id"))?;
        buf.extend_from_slice(&packet_id.to_be_bytes());
    }
    Ok(())
}

fn write_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (topic, qos) in &subscribe.topics {
        write_string(topic, buf);
        buf.push(*qos as u8);
    }
}

fn write_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend(suback.return_codes.iter().map(|code| *code as u8));
}

fn write_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&unsubscribe.packet_id.to_be_bytes());
    for topic in &unsubscribe.topics {
        write_string(topic, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode_packet, Connack, Will};

    fn connect() -> Connect {
        Connect {
            clean_session: true,
            keep_alive: 10,
            client_id: "device".to_string(),
            will: None,
            username: Some("device".to_string()),
            password: Some(b"secret".to_vec()),
        }
    }

    #[test]
    fn test_connect_bytes() {
        let packet = Packet::Connect(connect());
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf).unwrap();

        let mut expected = vec![0x10, 0x22];
        expected.extend_from_slice(&[0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xC2, 0x00, 0x0A]);
        expected.extend_from_slice(&[0x00, 0x06]);
        expected.extend_from_slice(b"device");
        expected.extend_from_slice(&[0x00, 0x06]);
        expected.extend_from_slice(b"device");
        expected.extend_from_slice(&[0x00, 0x06]);
        expected.extend_from_slice(b"secret");
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_connect_will_flags() {
        let mut connect = connect();
        connect.will = Some(Will {
            topic: "status".to_string(),
            message: Bytes::from_static(b"gone"),
            qos: QoS::ExactlyOnce,
            retain: true,
        });
        let mut buf = Vec::new();
        encode_packet(&Packet::Connect(connect.clone()), &mut buf).unwrap();
        // clean | will | qos 2 | retain | password | username
        assert_eq!(buf[9], 0x02 | 0x04 | 0x10 | 0x20 | 0x40 | 0x80);

        let (decoded, _) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(decoded, Packet::Connect(connect));
    }

    #[test]
    fn test_publish_size_counts_payload() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "test_topic".to_string(),
            packet_id: Some(1),
            payload: Bytes::from_static(b"0123456789"),
        });
        let size = serialiser_size(&publish).unwrap();
        assert_eq!(size.payload_size, 10);
        assert_eq!(size.remaining_len, 2 + 10 + 2 + 10);
        assert_eq!(size.message_len, 2 + size.remaining_len);

        let mut header = Vec::new();
        serialiser_write(&publish, &mut header, &size).unwrap();
        assert_eq!(header.len(), size.message_len - size.payload_size);
        assert_eq!(header[0], 0x32);
    }

    #[test]
    fn test_payload_ceiling() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: None,
            payload: Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        });
        assert_eq!(
            serialiser_size(&publish),
            Err(Error::PayloadTooLarge {
                size: MAX_PAYLOAD_SIZE + 1,
                max: MAX_PAYLOAD_SIZE
            })
        );
    }

    #[test]
    fn test_payload_at_ceiling_uses_three_length_bytes() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: None,
            payload: Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]),
        });
        let size = serialiser_size(&publish).unwrap();
        assert_eq!(size.remaining_len, 3 + MAX_PAYLOAD_SIZE);
        assert_eq!(size.message_len, 1 + 3 + size.remaining_len);
    }

    #[test]
    fn test_publish_qos1_requires_packet_id() {
        let publish = Packet::Publish(Publish {
            dup: true,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: None,
            payload: Bytes::new(),
        });
        let size = serialiser_size(&publish).unwrap();
        assert!(serialiser_write(&publish, &mut Vec::new(), &size).is_err());
    }

    #[test]
    fn test_acks_and_pings() {
        let cases: [(Packet, &[u8]); 6] = [
            (Packet::Puback { packet_id: 0x0102 }, &[0x40, 0x02, 0x01, 0x02]),
            (Packet::Pubrec { packet_id: 1 }, &[0x50, 0x02, 0x00, 0x01]),
            (Packet::Pubrel { packet_id: 1 }, &[0x62, 0x02, 0x00, 0x01]),
            (Packet::Pubcomp { packet_id: 1 }, &[0x70, 0x02, 0x00, 0x01]),
            (Packet::Pingreq, &[0xC0, 0x00]),
            (Packet::Disconnect, &[0xE0, 0x00]),
        ];
        for (packet, expected) in cases {
            let mut buf = Vec::new();
            encode_packet(&packet, &mut buf).unwrap();
            assert_eq!(buf, expected, "{:?}", packet);
        }
    }

    #[test]
    fn test_subscribe_bytes() {
        let packet = Packet::Subscribe(Subscribe {
            packet_id: 2,
            topics: vec![("a/+".to_string(), QoS::AtLeastOnce)],
        });
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf).unwrap();
        assert_eq!(buf, [0x82, 0x08, 0x00, 0x02, 0x00, 0x03, b'a', b'/', b'+', 0x01]);
    }

    #[test]
    fn test_connack_encodes_for_test_brokers() {
        let packet = Packet::Connack(Connack {
            session_present: false,
            return_code: 4,
        });
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf).unwrap();
        assert_eq!(buf, [0x20, 0x02, 0x00, 0x04]);
    }
}
