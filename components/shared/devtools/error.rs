/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Error vocabulary shared by both ends of a connection.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The `error` field of an error reply. The string forms are part of the wire
/// protocol and must not change.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCode {
    NoSuchActor,
    UnrecognizedPacketType,
    UnknownError,
    MissingParameter,
    BadParameterType,
    WrongState,
    /// Never sent on the wire. Used to reject calls that were in flight when
    /// the transport went away.
    ConnectionClosed,
    /// Any code an actor raises that is not listed above.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NoSuchActor => "noSuchActor",
            ErrorCode::UnrecognizedPacketType => "unrecognizedPacketType",
            ErrorCode::UnknownError => "unknownError",
            ErrorCode::MissingParameter => "missingParameter",
            ErrorCode::BadParameterType => "badParameterType",
            ErrorCode::WrongState => "wrongState",
            ErrorCode::ConnectionClosed => "connectionClosed",
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "noSuchActor" => ErrorCode::NoSuchActor,
            "unrecognizedPacketType" => ErrorCode::UnrecognizedPacketType,
            "unknownError" => ErrorCode::UnknownError,
            "missingParameter" => ErrorCode::MissingParameter,
            "badParameterType" => ErrorCode::BadParameterType,
            "wrongState" => ErrorCode::WrongState,
            "connectionClosed" => ErrorCode::ConnectionClosed,
            other => ErrorCode::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from(code.as_str()))
    }
}

/// An error as carried by an error reply: `{from, error, message}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtocolError {
    pub error: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl ProtocolError {
    pub fn new(error: ErrorCode, message: impl Into<String>) -> Self {
        ProtocolError {
            error,
            message: message.into(),
        }
    }

    pub fn connection_closed() -> Self {
        ProtocolError::new(ErrorCode::ConnectionClosed, "Connection closed")
    }

    pub fn code(&self) -> &ErrorCode {
        &self.error
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{}: {}", self.error, self.message)
        }
    }
}

impl std::error::Error for ProtocolError {}
