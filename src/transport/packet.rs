//! Packet codec
//!
//! A frame is one kind byte, optionally followed by a length-prefixed topic and
//! then a length-prefixed payload:
//!
//! ```text
//! u8   kind                      (1..=9)
//! u16  topic_len   topic bytes   (UTF-8, present iff >= 2 bytes follow the kind)
//! u16  payload_len payload bytes (raw,   present iff >= 2 bytes follow the topic)
//! ```
//!
//! Lengths are big-endian. There is no outer frame length, so the reader treats
//! every socket read as exactly one frame. Which kinds may carry a topic or a
//! payload is not checked here; decoding is purely structural.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::utils::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 5,
    SubAck = 6,
    PingReq = 7,
    PingResp = 8,
    Disconnect = 9,
}

impl PacketKind {
    pub const ALL: [PacketKind; 9] = [
        PacketKind::Connect,
        PacketKind::ConnAck,
        PacketKind::Publish,
        PacketKind::PubAck,
        PacketKind::Subscribe,
        PacketKind::SubAck,
        PacketKind::PingReq,
        PacketKind::PingResp,
        PacketKind::Disconnect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Connect => "CONNECT",
            PacketKind::ConnAck => "CONNACK",
            PacketKind::Publish => "PUBLISH",
            PacketKind::PubAck => "PUBACK",
            PacketKind::Subscribe => "SUBSCRIBE",
            PacketKind::SubAck => "SUBACK",
            PacketKind::PingReq => "PINGREQ",
            PacketKind::PingResp => "PINGRESP",
            PacketKind::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        PacketKind::ALL
            .get(usize::from(byte).wrapping_sub(1))
            .copied()
            .ok_or(CodecError::UnknownKind(byte))
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol packet.
///
/// Empty topics and payloads are stored as absent: on the wire a zero-length
/// field and a missing field look the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    topic: Option<String>,
    payload: Option<Bytes>,
}

impl Packet {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            topic: None,
            payload: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.topic = (!topic.is_empty()).then_some(topic);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        self.payload = (!payload.is_empty()).then_some(payload);
        self
    }

    pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::Publish)
            .with_topic(topic)
            .with_payload(payload)
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::new(PacketKind::Subscribe).with_topic(topic)
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Encodes the packet into one frame.
    ///
    /// A payload without a topic is preceded by a zero topic length so the
    /// decoder does not read the payload as the topic.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let topic = self.topic.as_deref().map(str::as_bytes);
        let payload = self.payload.as_deref();

        let mut buf = BytesMut::with_capacity(
            1 + topic.map_or(0, |t| 2 + t.len()) + payload.map_or(0, |p| 2 + p.len()),
        );
        buf.put_u8(self.kind as u8);

        match (topic, payload) {
            (Some(topic), _) => put_field(&mut buf, "topic", topic)?,
            (None, Some(_)) => buf.put_u16(0),
            (None, None) => {}
        }
        if let Some(payload) = payload {
            put_field(&mut buf, "payload", payload)?;
        }

        Ok(buf.freeze())
    }

    /// Decodes one frame. Bytes left over after the payload are ignored.
    pub fn decode(frame: &[u8]) -> Result<Packet, CodecError> {
        let (&kind, mut rest) = frame.split_first().ok_or(CodecError::Empty)?;
        let kind = PacketKind::try_from(kind)?;

        let topic = match take_field(&mut rest, "topic")? {
            Some(raw) => Some(std::str::from_utf8(raw)?.to_owned()),
            None => None,
        };
        let payload = take_field(&mut rest, "payload")?.map(Bytes::copy_from_slice);

        Ok(Packet {
            kind,
            topic,
            payload,
        })
    }
}

fn put_field(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        len: data.len(),
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Reads one length-prefixed field, or `None` when fewer than two bytes remain
/// or the declared length is zero.
fn take_field<'a>(rest: &mut &'a [u8], field: &'static str) -> Result<Option<&'a [u8]>, CodecError> {
    let mut cursor: &'a [u8] = *rest;
    if cursor.len() < 2 {
        return Ok(None);
    }
    let len = usize::from(cursor.get_u16());
    if len > cursor.len() {
        return Err(CodecError::Truncated {
            field,
            needed: len,
            available: cursor.len(),
        });
    }
    let (data, tail) = cursor.split_at(len);
    *rest = tail;
    Ok((len > 0).then_some(data))
}
