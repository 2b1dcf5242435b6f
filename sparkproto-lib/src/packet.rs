//! CoAP framing for protocol messages.
//!
//! Converts between raw plaintext frames and [`Message`]. The whole URI path
//! travels in a single Uri-Path option and the whole query in a single
//! Uri-Query option, the way the device firmware reads them.

use crate::constants::{CODE_BAD_REQUEST, MAX_REQUEST_CODE};
use crate::error::ProtocolError;
use crate::message::{self, MessageKind, MessageName, UriParams};
use bytes::Bytes;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet};
use std::borrow::Cow;

impl From<MessageType> for MessageKind {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Confirmable => MessageKind::Confirmable,
            MessageType::NonConfirmable => MessageKind::NonConfirmable,
            MessageType::Acknowledgement => MessageKind::Acknowledgement,
            MessageType::Reset => MessageKind::Reset,
        }
    }
}

impl From<MessageKind> for MessageType {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Confirmable => MessageType::Confirmable,
            MessageKind::NonConfirmable => MessageType::NonConfirmable,
            MessageKind::Acknowledgement => MessageType::Acknowledgement,
            MessageKind::Reset => MessageType::Reset,
        }
    }
}

/// A structured protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: u16,
    pub token: Option<u8>,
    pub code: u8,
    pub kind: MessageKind,
    pub path: Vec<u8>,
    pub query: Option<Vec<u8>>,
    pub max_age: Option<u32>,
    pub payload: Bytes,
}

impl Message {
    /// Start a message from its catalog entry, rendering the URI template.
    pub fn build(name: MessageName, id: u16, params: &UriParams) -> Self {
        let spec = message::spec(name);
        let (path, query) = match spec.uri {
            Some(template) => {
                let uri = message::render_uri(template, params);
                (uri.path, uri.query)
            }
            None => (Vec::new(), None),
        };
        Self {
            id,
            token: None,
            code: spec.code,
            kind: spec.kind,
            path,
            query,
            max_age: None,
            payload: Bytes::new(),
        }
    }

    pub fn with_token(mut self, token: Option<u8>) -> Self {
        self.token = token;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_max_age(mut self, seconds: u32) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// An empty message carries no code and no payload (keepalives, bare acks).
    pub fn is_empty(&self) -> bool {
        self.code == 0 && self.payload.is_empty()
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.kind == MessageKind::Acknowledgement
    }

    pub fn is_request(&self) -> bool {
        (1..=MAX_REQUEST_CODE).contains(&self.code)
    }

    /// Responses below 4.00 indicate success.
    pub fn is_success(&self) -> bool {
        self.code < CODE_BAD_REQUEST
    }

    pub fn path_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    /// First segment of the URI path, used to route requests.
    pub fn first_segment(&self) -> Cow<'_, str> {
        let end = self.path.iter().position(|&b| b == b'/').unwrap_or(self.path.len());
        String::from_utf8_lossy(&self.path[..end])
    }

    /// Path after the first segment, e.g. the event name of `e/<name>`.
    pub fn path_remainder(&self) -> Option<Cow<'_, str>> {
        let slash = self.path.iter().position(|&b| b == b'/')?;
        Some(String::from_utf8_lossy(&self.path[slash + 1..]))
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut packet = Packet::new();
        packet.header.set_type(self.kind.into());
        packet.header.code = MessageClass::from(self.code);
        packet.header.message_id = self.id;
        if let Some(token) = self.token {
            packet.set_token(vec![token]);
        }
        if !self.path.is_empty() {
            packet.add_option(CoapOption::UriPath, self.path.clone());
        }
        if let Some(max_age) = self.max_age {
            packet.add_option(CoapOption::MaxAge, encode_uint_option(max_age));
        }
        if let Some(query) = &self.query {
            packet.add_option(CoapOption::UriQuery, query.clone());
        }
        packet.payload = self.payload.to_vec();

        packet
            .to_bytes()
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(format!("cannot encode {}: {e:?}", self.path_str())))
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = ProtocolError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let packet = Packet::from_bytes(data).map_err(|e| ProtocolError::Malformed(format!("{e:?}")))?;

        let path = packet
            .get_option(CoapOption::UriPath)
            .map(|parts| join_option(parts.iter(), b'/'))
            .unwrap_or_default();
        let query = packet
            .get_option(CoapOption::UriQuery)
            .map(|parts| join_option(parts.iter(), b'&'));
        let max_age = packet
            .get_option(CoapOption::MaxAge)
            .and_then(|values| values.front())
            .map(|value| decode_uint_option(value));

        Ok(Message {
            id: packet.header.message_id,
            token: packet.get_token().first().copied(),
            code: u8::from(packet.header.code),
            kind: packet.header.get_type().into(),
            path,
            query,
            max_age,
            payload: Bytes::from(packet.payload),
        })
    }
}

impl TryFrom<Bytes> for Message {
    type Error = ProtocolError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Message::try_from(bytes.as_ref())
    }
}

/// Serialize a catalog message.
pub fn wrap(
    name: MessageName,
    id: u16,
    params: &UriParams,
    payload: Option<&[u8]>,
    token: Option<u8>,
) -> Result<Bytes, ProtocolError> {
    let mut message = Message::build(name, id, params).with_token(token);
    if let Some(payload) = payload {
        message = message.with_payload(Bytes::copy_from_slice(payload));
    }
    message.to_bytes()
}

/// Parse a raw frame into a message.
pub fn unwrap(data: &[u8]) -> Result<Message, ProtocolError> {
    Message::try_from(data)
}

fn join_option<'a>(parts: impl Iterator<Item = &'a Vec<u8>>, separator: u8) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, part) in parts.enumerate() {
        if i > 0 {
            out.push(separator);
        }
        out.extend_from_slice(part);
    }
    out
}

fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint_option(value: &[u8]) -> u32 {
    value.iter().take(4).fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}
