//! Static catalog of protocol messages.
//!
//! Each message name maps to its CoAP request code, confirmability, the name
//! of the message the device answers with, and an optional URI template.
//! Templates use mustache-style placeholders: `{{var}}` is HTML-escaped,
//! `{{{var}}}` is substituted verbatim (used for binary query values).

use crate::constants::{CODE_BAD_REQUEST, CODE_CHANGED, CODE_CONTENT, CODE_GET, CODE_POST, CODE_PUT, MAX_REQUEST_CODE};
use crate::error::ProtocolError;
use regex::bytes::{Captures, Regex};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MessageName {
    Hello,
    UpdateBegin,
    UpdateReady,
    UpdateAbort,
    Chunk,
    ChunkReceived,
    ChunkMissed,
    ChunkMissedAck,
    UpdateDone,
    FunctionCall,
    FunctionReturn,
    VariableRequest,
    VariableValue,
    PrivateEvent,
    PublicEvent,
    EventAck,
    Subscribe,
    SubscribeAck,
    SubscribeFail,
    Describe,
    DescribeReturn,
    GetTime,
    GetTimeReturn,
    SignalStart,
    SignalStartReturn,
    Ping,
    PingAck,
    Ignored,
}

impl FromStr for MessageName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CATALOG
            .iter()
            .map(|spec| spec.name)
            .find(|name| name.to_string() == s)
            .ok_or_else(|| ProtocolError::UnknownMessage(s.to_string()))
    }
}

/// CoAP message type as used by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    #[strum(to_string = "CON")]
    Confirmable,
    #[strum(to_string = "NON")]
    NonConfirmable,
    #[strum(to_string = "ACK")]
    Acknowledgement,
    #[strum(to_string = "RST")]
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpec {
    pub name: MessageName,
    pub code: u8,
    pub kind: MessageKind,
    /// Message the peer answers with.
    pub response: Option<MessageName>,
    /// Message the answer is classified as when it carries an error code.
    pub error_response: Option<MessageName>,
    pub uri: Option<&'static str>,
}

impl MessageSpec {
    const fn new(name: MessageName, code: u8, kind: MessageKind) -> Self {
        Self {
            name,
            code,
            kind,
            response: None,
            error_response: None,
            uri: None,
        }
    }

    const fn uri(mut self, uri: &'static str) -> Self {
        self.uri = Some(uri);
        self
    }

    const fn response(mut self, response: MessageName) -> Self {
        self.response = Some(response);
        self
    }

    const fn error_response(mut self, response: MessageName) -> Self {
        self.error_response = Some(response);
        self
    }

    pub fn expects_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn is_request(&self) -> bool {
        is_request_code(self.code)
    }
}

use MessageKind::{Acknowledgement as ACK, Confirmable as CON, NonConfirmable as NON};
use MessageName as N;

const EMPTY: u8 = 0x00;

pub static CATALOG: &[MessageSpec] = &[
    MessageSpec::new(N::Hello, CODE_POST, NON).uri("h"),
    MessageSpec::new(N::UpdateBegin, CODE_POST, CON)
        .uri("u")
        .response(N::UpdateReady)
        .error_response(N::UpdateAbort),
    MessageSpec::new(N::UpdateReady, CODE_CHANGED, ACK),
    MessageSpec::new(N::UpdateAbort, CODE_BAD_REQUEST, ACK),
    MessageSpec::new(N::Chunk, CODE_POST, CON)
        .uri("c?{{{crc}}}{{{index}}}")
        .response(N::ChunkReceived),
    MessageSpec::new(N::ChunkReceived, CODE_CHANGED, ACK),
    MessageSpec::new(N::ChunkMissed, CODE_GET, CON)
        .uri("c")
        .response(N::ChunkMissedAck),
    MessageSpec::new(N::ChunkMissedAck, EMPTY, ACK),
    MessageSpec::new(N::UpdateDone, CODE_PUT, CON).uri("u"),
    MessageSpec::new(N::FunctionCall, CODE_POST, CON)
        .uri("f/{{name}}?{{{args}}}")
        .response(N::FunctionReturn),
    MessageSpec::new(N::FunctionReturn, CODE_CHANGED, ACK),
    MessageSpec::new(N::VariableRequest, CODE_GET, CON)
        .uri("v/{{name}}")
        .response(N::VariableValue),
    MessageSpec::new(N::VariableValue, CODE_CONTENT, ACK),
    MessageSpec::new(N::PrivateEvent, CODE_POST, NON).uri("E/{{event_name}}"),
    MessageSpec::new(N::PublicEvent, CODE_POST, NON).uri("e/{{event_name}}"),
    MessageSpec::new(N::EventAck, EMPTY, ACK),
    MessageSpec::new(N::Subscribe, CODE_GET, CON)
        .uri("e/{{event_name}}")
        .response(N::SubscribeAck),
    MessageSpec::new(N::SubscribeAck, EMPTY, ACK),
    MessageSpec::new(N::SubscribeFail, CODE_BAD_REQUEST, ACK),
    MessageSpec::new(N::Describe, CODE_GET, CON)
        .uri("d")
        .response(N::DescribeReturn),
    MessageSpec::new(N::DescribeReturn, CODE_CONTENT, ACK),
    MessageSpec::new(N::GetTime, CODE_GET, CON)
        .uri("t")
        .response(N::GetTimeReturn),
    MessageSpec::new(N::GetTimeReturn, CODE_CONTENT, ACK),
    MessageSpec::new(N::SignalStart, CODE_PUT, CON)
        .uri("s")
        .response(N::SignalStartReturn),
    MessageSpec::new(N::SignalStartReturn, CODE_CHANGED, ACK),
    MessageSpec::new(N::Ping, EMPTY, CON),
    MessageSpec::new(N::PingAck, EMPTY, ACK),
    MessageSpec::new(N::Ignored, CODE_BAD_REQUEST, ACK),
];

/// Catalog entry for a message name.
pub fn spec(name: MessageName) -> &'static MessageSpec {
    CATALOG
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| unreachable!("every MessageName has a catalog entry"))
}

pub fn is_request_code(code: u8) -> bool {
    (1..=MAX_REQUEST_CODE).contains(&code)
}

/// Request routes keyed by (code, first URI path segment), built once.
static ROUTES: LazyLock<HashMap<(u8, String), MessageName>> = LazyLock::new(|| {
    CATALOG
        .iter()
        .filter(|spec| spec.is_request())
        .filter_map(|spec| {
            let uri = spec.uri?;
            let path = uri.split('?').next().unwrap_or(uri);
            let first = path.split('/').next().unwrap_or(path);
            Some(((spec.code, first.to_string()), spec.name))
        })
        .collect()
});

/// Classify an inbound request by its code and first path segment.
pub fn route(code: u8, first_segment: &str) -> Option<MessageName> {
    if !is_request_code(code) {
        return None;
    }
    ROUTES.get(&(code, first_segment.to_string())).copied()
}

/// Name of the answer to `request`, taking the response code into account.
pub fn response_for(request: MessageName, code: u8) -> Option<MessageName> {
    let spec = spec(request);
    if code >= CODE_BAD_REQUEST {
        if let Some(error) = spec.error_response {
            return Some(error);
        }
    }
    spec.response
}

/// Template parameters for a message URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriParams {
    values: HashMap<String, Vec<u8>>,
    raw_query: Option<Vec<u8>>,
}

impl UriParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl AsRef<[u8]>) {
        self.values.insert(name.to_string(), value.as_ref().to_vec());
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Write raw bytes as the URI query, bypassing template rendering.
    pub fn raw_query(mut self, query: impl Into<Vec<u8>>) -> Self {
        self.raw_query = Some(query.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.raw_query.is_none()
    }
}

/// A rendered URI: the path goes into one Uri-Path option and the query
/// into one Uri-Query option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUri {
    pub path: Vec<u8>,
    pub query: Option<Vec<u8>>,
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\{\s*(\w+)\s*\}\}\}|\{\{\s*(\w+)\s*\}\}").unwrap_or_else(|e| unreachable!("{e}"))
});

fn escape_html(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for &b in value {
        match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'\'' => out.extend_from_slice(b"&#39;"),
            _ => out.push(b),
        }
    }
    out
}

fn render_part(template: &str, params: &UriParams) -> Vec<u8> {
    PLACEHOLDER
        .replace_all(template.as_bytes(), |caps: &Captures| {
            if let Some(raw) = caps.get(1) {
                let name = String::from_utf8_lossy(raw.as_bytes());
                params.get(&name).map(<[u8]>::to_vec).unwrap_or_default()
            } else {
                let name = caps.get(2).map(|m| String::from_utf8_lossy(m.as_bytes())).unwrap_or_default();
                params.get(&name).map(escape_html).unwrap_or_default()
            }
        })
        .into_owned()
}

/// Render a URI template. The template is split on `?` before substitution
/// so binary values can never be mistaken for the query delimiter.
pub fn render_uri(template: &str, params: &UriParams) -> RenderedUri {
    let (path_template, query_template) = match template.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (template, None),
    };
    let path = render_part(path_template, params);
    let query = match &params.raw_query {
        Some(raw) => Some(raw.clone()),
        None => query_template
            .map(|q| render_part(q, params))
            .filter(|q| !q.is_empty()),
    };
    RenderedUri { path, query }
}
