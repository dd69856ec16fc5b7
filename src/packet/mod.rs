//! Packet model for stream entries.
//!
//! Stream entries are flat field maps. This module decodes them into one of
//! three explicit variants at the boundary and encodes variants back into
//! fields for appending.
//!
//! ```text
//! Event:    e=1  data=<json>
//! Request:  e=0  data=<json>  id=<uuid>  replyTo=<reply stream>
//! Response:      id=<uuid>  isDisposed=1|0  data=<json> | err=<json>
//! ```
//!
//! Decoding fails closed: an entry that fits no variant exactly is rejected
//! instead of being guessed at. Application payloads always live one level
//! down inside `data`, so they never collide with envelope fields.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HandlerError, Result, TransportError};

/// Raw field map of one stream entry.
pub type FieldMap = HashMap<String, String>;

/// Envelope field names.
pub mod fields {
    /// Event/request discriminator.
    pub const MARKER: &str = "e";
    pub const DATA: &str = "data";
    pub const ID: &str = "id";
    pub const REPLY_TO: &str = "replyTo";
    pub const ERR: &str = "err";
    pub const IS_DISPOSED: &str = "isDisposed";

    /// Marker value for fire-and-forget events.
    pub const EVENT_TAG: &str = "1";
    /// Marker value for requests expecting a response.
    pub const REQUEST_TAG: &str = "0";
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Event(EventPacket),
    Request(RequestPacket),
    Response(ResponsePacket),
}

/// Fire-and-forget message. Carries no identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    /// Serialized payload.
    pub data: String,
}

/// Message expecting a correlated response on `reply_to`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPacket {
    pub id: String,
    pub reply_to: String,
    /// Serialized payload.
    pub data: String,
}

/// Correlated answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePacket {
    pub id: String,
    pub outcome: ResponseOutcome,
    /// No further responses will follow for this id.
    pub is_disposed: bool,
}

/// Success or failure carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// Serialized result value.
    Data(String),
    /// Serialized [`HandlerError`].
    Err(String),
}

impl EventPacket {
    pub fn new<T: Serialize + ?Sized>(payload: &T) -> Result<Self> {
        Ok(Self {
            data: serde_json::to_string(payload)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

impl RequestPacket {
    /// New request with a fresh random id.
    pub fn new<T: Serialize + ?Sized>(reply_to: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            reply_to: reply_to.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

impl ResponsePacket {
    /// Final successful response.
    pub fn success(id: impl Into<String>, value: &Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Data(value.to_string()),
            is_disposed: true,
        }
    }

    /// Final failed response.
    pub fn failure(id: impl Into<String>, err: &HandlerError) -> Self {
        let encoded = serde_json::to_string(err).unwrap_or_else(|_| {
            Value::String(err.message.clone()).to_string()
        });
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Err(encoded),
            is_disposed: true,
        }
    }

    /// Mark the response as partial (more responses follow).
    pub fn partial(mut self) -> Self {
        self.is_disposed = false;
        self
    }

    /// Parse the carried value, or the carried failure.
    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            ResponseOutcome::Data(data) => Ok(serde_json::from_str(&data)?),
            ResponseOutcome::Err(err) => Err(decode_error(&err).into()),
        }
    }
}

/// Decode the `err` field. Accepts `{"name","message"}`, a bare JSON string,
/// or plain text.
fn decode_error(raw: &str) -> HandlerError {
    if let Ok(err) = serde_json::from_str::<HandlerError>(raw) {
        return err;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(message)) => HandlerError::new(message),
        Ok(Value::Object(map)) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(raw)
                .to_string();
            HandlerError::new(message)
        }
        _ => HandlerError::new(raw),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn required<'a>(fields: &'a FieldMap, name: &str, kind: &str) -> Result<&'a String> {
    fields
        .get(name)
        .ok_or_else(|| TransportError::MalformedPacket(format!("{kind} without '{name}' field")))
}

impl Packet {
    /// Decode a raw entry into exactly one variant.
    pub fn decode(raw: &FieldMap) -> Result<Self> {
        let marker = raw.get(fields::MARKER);
        let disposed = raw.get(fields::IS_DISPOSED);

        match (marker, disposed) {
            (Some(_), Some(_)) => Err(TransportError::MalformedPacket(
                "entry carries both a message marker and 'isDisposed'".to_string(),
            )),
            (Some(tag), None) if tag == fields::EVENT_TAG => {
                let data = required(raw, fields::DATA, "event")?;
                Ok(Packet::Event(EventPacket { data: data.clone() }))
            }
            (Some(tag), None) if tag == fields::REQUEST_TAG => {
                let data = required(raw, fields::DATA, "request")?;
                let id = required(raw, fields::ID, "request")?;
                let reply_to = required(raw, fields::REPLY_TO, "request")?;
                Ok(Packet::Request(RequestPacket {
                    id: id.clone(),
                    reply_to: reply_to.clone(),
                    data: data.clone(),
                }))
            }
            (Some(tag), None) => Err(TransportError::MalformedPacket(format!(
                "unknown message marker '{tag}'"
            ))),
            (None, Some(flag)) => {
                let id = required(raw, fields::ID, "response")?;
                let is_disposed = parse_flag(flag).ok_or_else(|| {
                    TransportError::MalformedPacket(format!("invalid 'isDisposed' value '{flag}'"))
                })?;
                let outcome = match (raw.get(fields::DATA), raw.get(fields::ERR)) {
                    (Some(_), Some(_)) => {
                        return Err(TransportError::MalformedPacket(
                            "response carries both 'data' and 'err'".to_string(),
                        ))
                    }
                    (Some(data), None) => ResponseOutcome::Data(data.clone()),
                    (None, Some(err)) => ResponseOutcome::Err(err.clone()),
                    (None, None) => {
                        return Err(TransportError::MalformedPacket(
                            "response without 'data' or 'err'".to_string(),
                        ))
                    }
                };
                Ok(Packet::Response(ResponsePacket {
                    id: id.clone(),
                    outcome,
                    is_disposed,
                }))
            }
            (None, None) => Err(TransportError::MalformedPacket(
                "entry matches no packet shape".to_string(),
            )),
        }
    }

    /// Encode into field/value pairs for appending.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Packet::Event(event) => vec![
                (fields::MARKER, fields::EVENT_TAG.to_string()),
                (fields::DATA, event.data.clone()),
            ],
            Packet::Request(request) => vec![
                (fields::MARKER, fields::REQUEST_TAG.to_string()),
                (fields::DATA, request.data.clone()),
                (fields::ID, request.id.clone()),
                (fields::REPLY_TO, request.reply_to.clone()),
            ],
            Packet::Response(response) => {
                let body = match &response.outcome {
                    ResponseOutcome::Data(data) => (fields::DATA, data.clone()),
                    ResponseOutcome::Err(err) => (fields::ERR, err.clone()),
                };
                vec![
                    (fields::ID, response.id.clone()),
                    body,
                    (
                        fields::IS_DISPOSED,
                        if response.is_disposed { "1" } else { "0" }.to_string(),
                    ),
                ]
            }
        }
    }
}

impl From<EventPacket> for Packet {
    fn from(packet: EventPacket) -> Self {
        Packet::Event(packet)
    }
}

impl From<RequestPacket> for Packet {
    fn from(packet: RequestPacket) -> Self {
        Packet::Request(packet)
    }
}

impl From<ResponsePacket> for Packet {
    fn from(packet: ResponsePacket) -> Self {
        Packet::Response(packet)
    }
}
