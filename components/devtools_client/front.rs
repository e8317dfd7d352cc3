/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Fronts are the client-side proxies of actors. Calls are checked against
//! the actor's spec before anything is sent.
//!
//! <https://searchfox.org/mozilla-central/source/devtools/shared/protocol/Front.js>

use std::fmt;
use std::sync::Arc;

use log::error;
use rdp_protocol::{ActorSpec, ErrorCode, ProtocolError};
use serde_json::Value;

use crate::client::{Client, front_argument};
use crate::reply::{Payload, PendingReply};

/// A handle on an actor. Clones refer to the same actor.
#[derive(Clone)]
pub struct Front {
    actor_id: String,
    type_name: String,
    client: Client,
}

impl fmt::Debug for Front {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Front")
            .field("actor_id", &self.actor_id)
            .field("type_name", &self.type_name)
            .finish()
    }
}

impl From<&Front> for Value {
    fn from(front: &Front) -> Value {
        Value::String(front.actor_id.clone())
    }
}

impl Front {
    pub(crate) fn new(actor_id: String, type_name: String, client: Client) -> Front {
        Front {
            actor_id,
            type_name,
            client,
        }
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn spec(&self) -> Option<&'static ActorSpec> {
        self.client.inner.specs.get(&self.type_name)
    }

    /// The last form the server sent for this actor.
    pub fn form(&self) -> Option<Value> {
        let state = self.client.state();
        state
            .fronts
            .get(&self.actor_id)
            .map(|entry| entry.form.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        !self.client.state().fronts.contains_key(&self.actor_id)
    }

    /// Call `method` with positional arguments. Options are passed as one
    /// object at their index. Fails without sending anything if the call
    /// does not match the spec or the front is gone.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<PendingReply, ProtocolError> {
        let Some(method_spec) = self.spec().and_then(|spec| spec.method(method)) else {
            error!("{} fronts have no method '{}'", self.type_name, method);
            return Err(ProtocolError::new(
                ErrorCode::UnrecognizedPacketType,
                format!("{} has no method '{}'", self.type_name, method),
            ));
        };
        self.client.send(&self.actor_id, Some(method_spec), |state| {
            if !state.fronts.contains_key(&self.actor_id) {
                return Err(ProtocolError::new(
                    ErrorCode::NoSuchActor,
                    format!("No such actor for ID: {}", self.actor_id),
                ));
            }
            method_spec
                .write_request(&self.actor_id, args, &mut |type_name, value| {
                    front_argument(state, type_name, value)
                })
                .map_err(|error| {
                    error!("Bad '{}' call on {}: {}", method, self.actor_id, error);
                    error.to_protocol()
                })
        })
    }

    /// Listen to an event this actor declares. Listeners run on the client's
    /// event thread, one event at a time, in the order they were added. They
    /// may make calls and wait for the replies.
    pub fn on<F>(&self, event: &str, listener: F) -> Result<(), ProtocolError>
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        if self.spec().and_then(|spec| spec.event(event)).is_none() {
            return Err(ProtocolError::new(
                ErrorCode::UnrecognizedPacketType,
                format!("{} does not emit '{}'", self.type_name, event),
            ));
        }
        let mut state = self.client.state();
        let Some(entry) = state.fronts.get_mut(&self.actor_id) else {
            return Err(ProtocolError::new(
                ErrorCode::NoSuchActor,
                format!("No such actor for ID: {}", self.actor_id),
            ));
        };
        entry
            .listeners
            .entry(event.to_owned())
            .or_default()
            .push(Arc::new(listener));
        Ok(())
    }

    /// Forget this front locally. Calls still waiting are rejected with
    /// `noSuchActor`. Destroying twice is harmless.
    pub fn destroy(&self) {
        self.client.destroy_front(&self.actor_id);
    }
}
