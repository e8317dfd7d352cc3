/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use rdp_protocol::{ProtocolError, actor_id};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::client::Client;
use crate::front::Front;

/// The decoded fields of a reply or an event. Actor-typed fields can be
/// turned into fronts.
#[derive(Clone)]
pub struct Payload {
    values: Map<String, Value>,
    client: Client,
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload").field(&self.values).finish()
    }
}

impl Payload {
    pub(crate) fn new(values: Map<String, Value>, client: Client) -> Payload {
        Payload { values, client }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }

    /// Deserialize one field. A missing field reads as `null`.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> Result<T, serde_json::Error> {
        T::deserialize(self.values.get(name).unwrap_or(&Value::Null))
    }

    /// The front for an actor-typed field.
    pub fn front(&self, name: &str) -> Option<Front> {
        let id = actor_id(self.values.get(name)?)?;
        self.client.front(id)
    }

    /// The fronts for an array of actors.
    pub fn fronts(&self, name: &str) -> Vec<Front> {
        self.values
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(actor_id)
                    .filter_map(|id| self.client.front(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub(crate) type ReplySender = Sender<Result<Payload, ProtocolError>>;

/// The eventual reply to a call. Dropping it does not cancel the call. Once
/// a result has been handed out, later waits report `connectionClosed`.
pub struct PendingReply {
    receiver: Receiver<Result<Payload, ProtocolError>>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("ready", &!self.receiver.is_empty())
            .finish()
    }
}

impl PendingReply {
    pub(crate) fn new() -> (ReplySender, PendingReply) {
        let (sender, receiver) = bounded(1);
        (sender, PendingReply { receiver })
    }

    pub(crate) fn ready(result: Result<Payload, ProtocolError>) -> PendingReply {
        let (sender, reply) = PendingReply::new();
        let _ = sender.send(result);
        reply
    }

    /// Block until the reply arrives.
    pub fn wait(self) -> Result<Payload, ProtocolError> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(ProtocolError::connection_closed()))
    }

    /// Block for at most `timeout`. `None` means no reply yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Payload, ProtocolError>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(ProtocolError::connection_closed())),
        }
    }

    pub fn try_wait(&self) -> Option<Result<Payload, ProtocolError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ProtocolError::connection_closed())),
        }
    }
}
