// MQTT 3.1.1 subset codec: the packets the broker edge actually speaks.
// Decoding is incremental over a byte buffer; an incomplete packet leaves
// the buffer untouched and reports `None` so the reader can fetch more.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("malformed packet")]
    Malformed,
    #[error("malformed remaining length")]
    MalformedLength,
    #[error("packet exceeds maximum size")]
    TooLarge,
    #[error("unsupported packet type {0}")]
    UnsupportedType(u8),
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocol(u8),
    #[error("unsupported qos {0}")]
    UnsupportedQos(u8),
}

const TYPE_CONNECT: u8 = 1;
const TYPE_CONNACK: u8 = 2;
const TYPE_PUBLISH: u8 = 3;
const TYPE_PUBACK: u8 = 4;
const TYPE_SUBSCRIBE: u8 = 8;
const TYPE_SUBACK: u8 = 9;
const TYPE_UNSUBSCRIBE: u8 = 10;
const TYPE_UNSUBACK: u8 = 11;
const TYPE_PINGREQ: u8 = 12;
const TYPE_PINGRESP: u8 = 13;
const TYPE_DISCONNECT: u8 = 14;

// CONNACK return codes we emit.
pub const CONNECT_ACCEPTED: u8 = 0;
pub const CONNECT_NOT_AUTHORIZED: u8 = 5;

// SUBACK failure return code per the 3.1.1 spec.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: Bytes,
    pub payload: Bytes,
    pub message_id: u16,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub message_id: u16,
    pub topics: Vec<(Bytes, u8)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub message_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub message_id: u16,
    pub topics: Vec<Bytes>,
}

/// A single MQTT control packet.
///
/// ```
/// use beacon_mqtt::{Packet, Publish};
/// use bytes::{Bytes, BytesMut};
///
/// let packet = Packet::Publish(Publish {
///     topic: Bytes::from_static(b"key/a/"),
///     payload: Bytes::from_static(b"hi"),
///     message_id: 0,
///     qos: 0,
///     retain: false,
/// });
/// let mut buf = BytesMut::new();
/// packet.encode(&mut buf);
/// let decoded = Packet::decode(&mut buf, 1024).expect("decode").expect("complete");
/// assert_eq!(decoded, packet);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { message_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { message_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn take_string(body: &mut Bytes) -> Result<Bytes> {
    if body.remaining() < 2 {
        return Err(Error::Malformed);
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(Error::Malformed);
    }
    Ok(body.split_to(len))
}

fn take_utf8(body: &mut Bytes) -> Result<String> {
    let raw = take_string(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Malformed)
}

fn encode_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

// Returns (value, header bytes consumed) or None when more bytes are needed.
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate().take(4) {
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    if buf.len() >= 4 {
        return Err(Error::MalformedLength);
    }
    Ok(None)
}

impl Packet {
    /// Append the encoded packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        let header = match self {
            Packet::Connect(connect) => {
                put_string(&mut body, b"MQTT");
                body.put_u8(4);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= 0x02;
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);
                put_string(&mut body, connect.client_id.as_bytes());
                if let Some(username) = &connect.username {
                    put_string(&mut body, username.as_bytes());
                }
                if let Some(password) = &connect.password {
                    put_string(&mut body, password);
                }
                TYPE_CONNECT << 4
            }
            Packet::Connack(connack) => {
                body.put_u8(connack.session_present as u8);
                body.put_u8(connack.return_code);
                TYPE_CONNACK << 4
            }
            Packet::Publish(publish) => {
                put_string(&mut body, &publish.topic);
                if publish.qos > 0 {
                    body.put_u16(publish.message_id);
                }
                body.put_slice(&publish.payload);
                (TYPE_PUBLISH << 4) | (publish.qos << 1) | (publish.retain as u8)
            }
            Packet::Puback { message_id } => {
                body.put_u16(*message_id);
                TYPE_PUBACK << 4
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.message_id);
                for (topic, qos) in &subscribe.topics {
                    put_string(&mut body, topic);
                    body.put_u8(*qos);
                }
                (TYPE_SUBSCRIBE << 4) | 0x02
            }
            Packet::Suback(suback) => {
                body.put_u16(suback.message_id);
                for code in &suback.return_codes {
                    body.put_u8(*code);
                }
                TYPE_SUBACK << 4
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.put_u16(unsubscribe.message_id);
                for topic in &unsubscribe.topics {
                    put_string(&mut body, topic);
                }
                (TYPE_UNSUBSCRIBE << 4) | 0x02
            }
            Packet::Unsuback { message_id } => {
                body.put_u16(*message_id);
                TYPE_UNSUBACK << 4
            }
            Packet::Pingreq => TYPE_PINGREQ << 4,
            Packet::Pingresp => TYPE_PINGRESP << 4,
            Packet::Disconnect => TYPE_DISCONNECT << 4,
        };
        buf.put_u8(header);
        encode_remaining_length(buf, body.len());
        buf.put_slice(&body);
    }

    /// Decode one packet from the front of `buf`. Returns `Ok(None)` when
    /// the buffer does not yet hold a complete packet; consumed bytes are
    /// only removed once a full packet is present.
    pub fn decode(buf: &mut BytesMut, max_packet: usize) -> Result<Option<Packet>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let header = buf[0];
        let Some((remaining, header_len)) = decode_remaining_length(&buf[1..])? else {
            return Ok(None);
        };
        if remaining > max_packet {
            return Err(Error::TooLarge);
        }
        let total = 1 + header_len + remaining;
        if buf.len() < total {
            return Ok(None);
        }
        let mut frame = buf.split_to(total).freeze();
        frame.advance(1 + header_len);
        Self::decode_body(header, frame)
    }

    fn decode_body(header: u8, mut body: Bytes) -> Result<Option<Packet>> {
        let packet_type = header >> 4;
        let packet = match packet_type {
            TYPE_CONNECT => {
                let _protocol = take_string(&mut body)?;
                if body.remaining() < 4 {
                    return Err(Error::Malformed);
                }
                let level = body.get_u8();
                if level != 4 {
                    return Err(Error::UnsupportedProtocol(level));
                }
                let flags = body.get_u8();
                let keep_alive = body.get_u16();
                let client_id = take_utf8(&mut body)?;
                if flags & 0x04 != 0 {
                    // Will topic and message are accepted and discarded.
                    take_string(&mut body)?;
                    take_string(&mut body)?;
                }
                let username = if flags & 0x80 != 0 {
                    Some(take_utf8(&mut body)?)
                } else {
                    None
                };
                let password = if flags & 0x40 != 0 {
                    Some(take_string(&mut body)?)
                } else {
                    None
                };
                Packet::Connect(Connect {
                    client_id,
                    username,
                    password,
                    keep_alive,
                    clean_session: flags & 0x02 != 0,
                })
            }
            TYPE_CONNACK => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                let session_present = body.get_u8() & 0x01 != 0;
                let return_code = body.get_u8();
                Packet::Connack(Connack {
                    session_present,
                    return_code,
                })
            }
            TYPE_PUBLISH => {
                let qos = (header >> 1) & 0x03;
                if qos > 1 {
                    return Err(Error::UnsupportedQos(qos));
                }
                let retain = header & 0x01 != 0;
                let topic = take_string(&mut body)?;
                let message_id = if qos > 0 {
                    if body.remaining() < 2 {
                        return Err(Error::Malformed);
                    }
                    body.get_u16()
                } else {
                    0
                };
                Packet::Publish(Publish {
                    topic,
                    payload: body,
                    message_id,
                    qos,
                    retain,
                })
            }
            TYPE_PUBACK => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                Packet::Puback {
                    message_id: body.get_u16(),
                }
            }
            TYPE_SUBSCRIBE => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                let message_id = body.get_u16();
                let mut topics = Vec::new();
                while body.has_remaining() {
                    let topic = take_string(&mut body)?;
                    if !body.has_remaining() {
                        return Err(Error::Malformed);
                    }
                    topics.push((topic, body.get_u8()));
                }
                if topics.is_empty() {
                    return Err(Error::Malformed);
                }
                Packet::Subscribe(Subscribe { message_id, topics })
            }
            TYPE_SUBACK => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                let message_id = body.get_u16();
                let return_codes = body.to_vec();
                Packet::Suback(Suback {
                    message_id,
                    return_codes,
                })
            }
            TYPE_UNSUBSCRIBE => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                let message_id = body.get_u16();
                let mut topics = Vec::new();
                while body.has_remaining() {
                    topics.push(take_string(&mut body)?);
                }
                if topics.is_empty() {
                    return Err(Error::Malformed);
                }
                Packet::Unsubscribe(Unsubscribe { message_id, topics })
            }
            TYPE_UNSUBACK => {
                if body.remaining() < 2 {
                    return Err(Error::Malformed);
                }
                Packet::Unsuback {
                    message_id: body.get_u16(),
                }
            }
            TYPE_PINGREQ => Packet::Pingreq,
            TYPE_PINGRESP => Packet::Pingresp,
            TYPE_DISCONNECT => Packet::Disconnect,
            other => return Err(Error::UnsupportedType(other)),
        };
        Ok(Some(packet))
    }
}
