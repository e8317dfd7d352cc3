/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The client end of a connection.
//!
//! Replies carry no request ID. A reply or error from an actor answers the
//! oldest call to that actor still waiting, which holds because the server
//! answers the requests of each actor in the order they were sent.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use rdp_protocol::marshal::MarshalError;
use rdp_protocol::packet::{self, Packet};
use rdp_protocol::{
    ErrorCode, MarshalErrorKind, MethodSpec, PacketSink, PacketSource, ProtocolError, SpecRegistry,
    TransportError, actor_id,
};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::front::Front;
use crate::reply::{Payload, PendingReply, ReplySender};

pub(crate) type Listener = Arc<dyn Fn(&Payload) + Send + Sync>;

/// An event and the listeners it is for, handed to the event thread.
type Delivery = (Vec<Listener>, Payload);

/// Everything the client knows about one actor on the server.
pub(crate) struct FrontEntry {
    pub(crate) type_name: String,
    /// The front whose reply or event introduced this one. Destroying it
    /// destroys this front too.
    parent: Option<String>,
    /// The last form seen for the actor.
    pub(crate) form: Value,
    pub(crate) listeners: FxHashMap<String, Vec<Listener>>,
}

struct PendingCall {
    /// `None` for raw requests, whose reply is handed over undecoded.
    method: Option<&'static MethodSpec>,
    sender: ReplySender,
}

#[derive(Default)]
pub(crate) struct ClientState {
    pub(crate) fronts: FxHashMap<String, FrontEntry>,
    pending: FxHashMap<String, VecDeque<PendingCall>>,
    /// Replies still due from the server for calls already rejected locally.
    discard: FxHashMap<String, usize>,
    closed: bool,
}

pub(crate) struct ClientInner {
    sink: Mutex<Box<dyn PacketSink>>,
    state: Mutex<ClientState>,
    pub(crate) specs: &'static SpecRegistry,
    greeting: Packet,
}

/// A connection to a remote debugging server. Cheap to clone; every clone
/// talks over the same transport.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub enum ConnectError {
    Transport(TransportError),
    /// The server went away before greeting us.
    Closed,
    BadGreeting(Value),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Transport(error) => write!(f, "transport error: {error}"),
            ConnectError::Closed => write!(f, "connection closed before the greeting"),
            ConnectError::BadGreeting(greeting) => write!(f, "unexpected greeting: {greeting}"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        ConnectError::Transport(error)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Read the greeting, then start reading packets in the background.
    /// `specs` must contain a `root` spec.
    pub fn connect(
        sink: Box<dyn PacketSink>,
        mut source: Box<dyn PacketSource>,
        specs: &'static SpecRegistry,
    ) -> Result<Client, ConnectError> {
        let greeting = match source.recv_packet()? {
            Some(Value::Object(greeting)) if packet::from(&greeting) == Some("root") => greeting,
            Some(other) => return Err(ConnectError::BadGreeting(other)),
            None => return Err(ConnectError::Closed),
        };
        info!(
            "Connected to {} server",
            greeting
                .get("applicationType")
                .and_then(Value::as_str)
                .unwrap_or("an unknown")
        );

        let mut state = ClientState::default();
        state.fronts.insert(
            "root".to_owned(),
            FrontEntry {
                type_name: "root".to_owned(),
                parent: None,
                form: Value::Object(greeting.clone()),
                listeners: FxHashMap::default(),
            },
        );
        let client = Client {
            inner: Arc::new(ClientInner {
                sink: Mutex::new(sink),
                state: Mutex::new(state),
                specs,
                greeting,
            }),
        };

        let (events, deliveries) = unbounded();
        thread::Builder::new()
            .name("RdpClientEvents".to_owned())
            .spawn(move || deliver_events(deliveries))
            .map_err(|error| ConnectError::Transport(error.into()))?;
        let reader = client.clone();
        thread::Builder::new()
            .name("RdpClientReader".to_owned())
            .spawn(move || reader.read_packets(source, events))
            .map_err(|error| ConnectError::Transport(error.into()))?;
        Ok(client)
    }

    pub fn greeting(&self) -> &Packet {
        &self.inner.greeting
    }

    pub fn root(&self) -> Front {
        Front::new("root".to_owned(), "root".to_owned(), self.clone())
    }

    /// The front for a known actor, unless it was destroyed.
    pub fn front(&self, actor_id: &str) -> Option<Front> {
        let state = lock(&self.inner.state);
        let entry = state.fronts.get(actor_id)?;
        Some(Front::new(
            actor_id.to_owned(),
            entry.type_name.clone(),
            self.clone(),
        ))
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Send an untyped packet. The reply is the next packet from the
    /// addressed actor that is not an event, handed over as is.
    pub fn request(&self, packet: Packet) -> Result<PendingReply, ProtocolError> {
        let Some(to) = packet::to(&packet).map(str::to_owned) else {
            return Err(ProtocolError::new(
                ErrorCode::MissingParameter,
                "Missing 'to'",
            ));
        };
        self.send(&to, None, |_| Ok(packet))
    }

    /// Close the transport. Every call still waiting is rejected.
    pub fn close(&self) {
        lock(&self.inner.sink).close();
        self.shutdown();
    }

    /// Build a request under the state lock, queue its reply and send it.
    /// Holding the sink lock throughout keeps the queue in wire order.
    pub(crate) fn send(
        &self,
        to: &str,
        method: Option<&'static MethodSpec>,
        build: impl FnOnce(&ClientState) -> Result<Packet, ProtocolError>,
    ) -> Result<PendingReply, ProtocolError> {
        let mut sink = lock(&self.inner.sink);
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(ProtocolError::connection_closed());
        }
        let packet = build(&*state)?;
        let reply = match method {
            Some(method) if method.is_oneway() => {
                PendingReply::ready(Ok(Payload::new(Map::new(), self.clone())))
            },
            _ => {
                let (sender, reply) = PendingReply::new();
                state
                    .pending
                    .entry(to.to_owned())
                    .or_default()
                    .push_back(PendingCall { method, sender });
                reply
            },
        };
        drop(state);

        if let Err(error) = sink.send_packet(&packet) {
            warn!("Error writing to the RDP server: {}", error);
            drop(sink);
            self.shutdown();
            return Err(ProtocolError::connection_closed());
        }
        Ok(reply)
    }

    /// Forget a front. Calls still waiting on it are rejected, and their
    /// replies are ignored when they arrive.
    pub(crate) fn destroy_front(&self, actor_id: &str) {
        let mut state = lock(&self.inner.state);
        destroy_front(&mut state, actor_id);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.inner.state)
    }

    fn shutdown(&self) {
        let pending = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        for call in pending.into_values().flatten() {
            let _ = call.sender.send(Err(ProtocolError::connection_closed()));
        }
        info!("RDP client connection closed");
    }

    /// Runs on the reader thread. Listeners are called on the event thread,
    /// so they may wait for replies.
    fn read_packets(self, mut source: Box<dyn PacketSource>, events: Sender<Delivery>) {
        loop {
            match source.recv_packet() {
                Ok(Some(packet)) => self.handle_packet(packet, &events),
                Ok(None) => {
                    debug!("RDP server closed the connection");
                    break;
                },
                Err(error) => {
                    error!("Failed to read message from RDP server: {}", error);
                    break;
                },
            }
        }
        self.shutdown();
    }

    fn handle_packet(&self, value: Value, events: &Sender<Delivery>) {
        let Value::Object(packet) = value else {
            warn!("Received a packet that is not an object: {}", value);
            return;
        };
        let Some(from) = packet::from(&packet).map(str::to_owned) else {
            warn!("Received a packet without 'from': {:?}", packet);
            return;
        };

        let mut state = lock(&self.inner.state);
        let is_reply = packet::packet_type(&packet).is_none() || packet::error(&packet).is_some();
        if !is_reply {
            if let Some(event) = event_spec(&state, self.inner.specs, &from, &packet) {
                let delivery = self.handle_event(&mut state, &from, event, &packet);
                drop(state);
                if let Some(delivery) = delivery.filter(|(listeners, _)| !listeners.is_empty()) {
                    let _ = events.send(delivery);
                }
                return;
            }
            if !state.fronts.contains_key(&from) {
                debug!(
                    "Ignoring {:?} from {}, whose front is gone",
                    packet::packet_type(&packet),
                    from
                );
                return;
            }
        }

        if is_reply {
            if let Some(count) = state.discard.get_mut(&from) {
                *count -= 1;
                if *count == 0 {
                    state.discard.remove(&from);
                }
                debug!("Ignoring reply from {}, whose front is gone", from);
                return;
            }
        }
        let Some(call) = state.pending.get_mut(&from).and_then(VecDeque::pop_front) else {
            warn!("Unexpected packet from {}: {:?}", from, packet);
            return;
        };
        if state.pending.get(&from).is_some_and(VecDeque::is_empty) {
            state.pending.remove(&from);
        }

        let result = match (packet::error(&packet), call.method) {
            (Some(error), _) => Err(error),
            (None, None) => Ok(packet),
            (None, Some(method)) => {
                let specs = self.inner.specs;
                let decoded = method.read_response(&packet, &mut |type_name, value| {
                    register_front(&mut state, specs, &from, type_name, value)
                });
                match decoded {
                    Ok(values) => {
                        if method.is_release() {
                            destroy_front(&mut state, &from);
                        }
                        Ok(values)
                    },
                    Err(error) => {
                        error!(
                            "Reply to '{}' from {} does not match its spec: {}",
                            method.name(),
                            from,
                            error
                        );
                        Err(error.to_protocol())
                    },
                }
            },
        };
        drop(state);
        let _ = call
            .sender
            .send(result.map(|values| Payload::new(values, self.clone())));
    }

    /// Decode an event and apply its effect on fronts. Returns the listeners
    /// to call once the state is unlocked.
    fn handle_event(
        &self,
        state: &mut ClientState,
        from: &str,
        event: &'static rdp_protocol::EventSpec,
        packet: &Packet,
    ) -> Option<Delivery> {
        let specs = self.inner.specs;
        let values = match event.read_event(packet, &mut |type_name, value| {
            register_front(state, specs, from, type_name, value)
        }) {
            Ok(values) => values,
            Err(error) => {
                error!(
                    "'{}' event from {} does not match its spec: {}",
                    event.name(),
                    from,
                    error
                );
                return None;
            },
        };

        let listeners = state
            .fronts
            .get(from)
            .and_then(|entry| entry.listeners.get(event.name()))
            .cloned()
            .unwrap_or_default();
        match event.name() {
            "descriptor-destroyed" => destroy_front(state, from),
            "target-destroyed-form" => {
                if let Some(target) = values.get("target").and_then(actor_id) {
                    destroy_front(state, target);
                }
            },
            _ => {},
        }
        Some((listeners, Payload::new(values, self.clone())))
    }
}

/// Call listeners in the order their events arrived.
fn deliver_events(deliveries: Receiver<Delivery>) {
    for (listeners, payload) in deliveries {
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&payload))).is_err() {
                error!("Event listener panicked");
            }
        }
    }
}

/// The spec of `packet` if it is an event the sending front declares.
fn event_spec(
    state: &ClientState,
    specs: &'static SpecRegistry,
    from: &str,
    packet: &Packet,
) -> Option<&'static rdp_protocol::EventSpec> {
    let entry = state.fronts.get(from)?;
    specs
        .get(&entry.type_name)?
        .event(packet::packet_type(packet)?)
}

/// Make sure there is a front for an actor named in a reply or event from
/// `parent`.
fn register_front(
    state: &mut ClientState,
    specs: &SpecRegistry,
    parent: &str,
    type_name: &str,
    value: &Value,
) -> Result<Value, MarshalError> {
    let Some(id) = actor_id(value) else {
        return Err(MarshalError::bad_type("", type_name));
    };
    if !specs.contains(type_name) {
        return Err(MarshalError::bad_type("", type_name));
    }
    match state.fronts.get_mut(id) {
        Some(entry) if entry.type_name != type_name => Err(MarshalError::new(
            "",
            MarshalErrorKind::WrongActorType {
                expected: type_name.to_owned(),
                found: entry.type_name.clone(),
            },
        )),
        Some(entry) => {
            if value.is_object() {
                entry.form = value.clone();
            }
            Ok(value.clone())
        },
        None => {
            debug!("New {} front {}", type_name, id);
            let form = match value {
                Value::Object(_) => value.clone(),
                _ => serde_json::json!({ "actor": id }),
            };
            state.fronts.insert(
                id.to_owned(),
                FrontEntry {
                    type_name: type_name.to_owned(),
                    parent: (id != parent).then(|| parent.to_owned()),
                    form,
                    listeners: FxHashMap::default(),
                },
            );
            Ok(value.clone())
        },
    }
}

/// Resolve an actor argument of a call to the ID of a live front.
pub(crate) fn front_argument(
    state: &ClientState,
    type_name: &str,
    value: &Value,
) -> Result<Value, MarshalError> {
    let Some(id) = actor_id(value) else {
        return Err(MarshalError::bad_type("", type_name));
    };
    match state.fronts.get(id) {
        None => Err(MarshalError::new(
            "",
            MarshalErrorKind::UnknownActor(id.to_owned()),
        )),
        Some(entry) if entry.type_name != type_name => Err(MarshalError::new(
            "",
            MarshalErrorKind::WrongActorType {
                expected: type_name.to_owned(),
                found: entry.type_name.clone(),
            },
        )),
        Some(_) => Ok(Value::String(id.to_owned())),
    }
}

/// Destroy a front and every front it introduced.
fn destroy_front(state: &mut ClientState, actor_id: &str) {
    let mut stack = vec![actor_id.to_owned()];
    while let Some(actor_id) = stack.pop() {
        if state.fronts.remove(&actor_id).is_none() {
            continue;
        }
        debug!("Destroyed front {}", actor_id);
        stack.extend(
            state
                .fronts
                .iter()
                .filter(|(_, entry)| entry.parent.as_deref() == Some(actor_id.as_str()))
                .map(|(child, _)| child.clone()),
        );
        let Some(calls) = state.pending.remove(&actor_id) else {
            continue;
        };
        *state.discard.entry(actor_id.clone()).or_default() += calls.len();
        for call in calls {
            let _ = call.sender.send(Err(ProtocolError::new(
                ErrorCode::NoSuchActor,
                format!("No such actor for ID: {actor_id}"),
            )));
        }
    }
}
