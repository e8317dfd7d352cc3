/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Packet shapes exchanged over a connection.
//!
//! Requests look like `{to, type, ...args}`, replies like `{from, ...fields}`,
//! error replies like `{from, error, message}` and events like
//! `{from, type, ...payload}`. A packet is always a JSON object.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ErrorCode, ProtocolError};

pub type Packet = Map<String, Value>;

#[derive(Serialize)]
pub struct EmptyReplyMsg {
    pub from: String,
}

/// An error reply. `from` is omitted when the packet could not be attributed
/// to any actor.
#[derive(Serialize)]
pub struct ErrorReplyMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub error: ProtocolError,
}

/// The name of the actor a request is addressed to.
pub fn to(packet: &Packet) -> Option<&str> {
    packet.get("to").and_then(Value::as_str)
}

/// The name of the actor a reply or event comes from.
pub fn from(packet: &Packet) -> Option<&str> {
    packet.get("from").and_then(Value::as_str)
}

/// The method name of a request or the event name of an event.
pub fn packet_type(packet: &Packet) -> Option<&str> {
    packet.get("type").and_then(Value::as_str)
}

/// Extract the error carried by an error reply, if this is one.
pub fn error(packet: &Packet) -> Option<ProtocolError> {
    let code = packet.get("error")?.as_str()?;
    let message = packet
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ProtocolError::new(ErrorCode::from(code), message))
}

/// Serialize a message struct into a packet. Fails if the message does not
/// serialize to a JSON object.
pub fn to_packet<T: Serialize>(msg: &T) -> Result<Packet, serde_json::Error> {
    match serde_json::to_value(msg)? {
        Value::Object(packet) => Ok(packet),
        other => Err(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

/// Build an error reply packet.
pub fn error_reply(from: Option<&str>, error: ProtocolError) -> Packet {
    let msg = ErrorReplyMsg {
        from: from.map(str::to_owned),
        error,
    };
    // Both fields are plain strings; this cannot produce a non-object.
    to_packet(&msg).unwrap_or_default()
}
