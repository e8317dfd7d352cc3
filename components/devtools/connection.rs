/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Request dispatch for a single client connection.
//!
//! Each connection owns its actors and runs on its own thread. Packets from
//! the client, completions of deferred replies and debuggee events all arrive
//! through one inbox, so actors never see concurrent calls. A request whose
//! handler defers its reply keeps its actor busy: later requests to that actor
//! queue behind it, which keeps replies in request order without any request
//! IDs on the wire.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, trace, warn};
use rdp_protocol::packet::{self, Packet};
use rdp_protocol::{ErrorCode, MethodSpec, PacketSink, PacketSource, ProtocolError, TransportError};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::actor::{
    ActorError, ActorRegistry, ClientRequest, Reply, error_packet, resolve_actor_form,
    resolve_actor_id,
};
use crate::debuggee::DebuggeeEvent;

pub(crate) enum ConnectionMsg {
    /// A packet read from the client.
    Packet(Value),
    /// A deferred reply is ready.
    Completed {
        actor: String,
        result: Result<Map<String, Value>, ActorError>,
    },
    Debuggee(u32, DebuggeeEvent),
    Close,
}

/// A request whose reply was deferred, and the packets that arrived for the
/// same actor in the meantime.
struct InFlight {
    method: &'static MethodSpec,
    queue: VecDeque<Packet>,
}

pub(crate) struct Connection {
    registry: ActorRegistry,
    sink: Box<dyn PacketSink>,
    inbox: Sender<ConnectionMsg>,
    receiver: Receiver<ConnectionMsg>,
    in_flight: FxHashMap<String, InFlight>,
}

/// A running connection.
pub struct ConnectionHandle {
    sender: Sender<ConnectionMsg>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// Forward a debuggee event. Returns false once the connection is gone.
    pub fn notify(&self, browser_id: u32, event: DebuggeeEvent) -> bool {
        self.sender
            .send(ConnectionMsg::Debuggee(browser_id, event))
            .is_ok()
    }

    /// Ask the connection to shut down. Pending requests are dropped.
    pub fn close(&self) {
        let _ = self.sender.send(ConnectionMsg::Close);
    }

    /// Whether the connection has shut down, on its own or when asked to.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the connection thread to finish.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("RDP connection thread panicked");
            }
        }
    }
}

impl Connection {
    pub(crate) fn new(sink: Box<dyn PacketSink>) -> Connection {
        let (inbox, receiver) = unbounded();
        Connection {
            registry: ActorRegistry::new(),
            sink,
            inbox,
            receiver,
            in_flight: FxHashMap::default(),
        }
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ActorRegistry {
        &mut self.registry
    }

    /// Start the reader and dispatcher threads. `greeting` is the first
    /// packet the client sees.
    pub(crate) fn spawn(self, source: Box<dyn PacketSource>, greeting: Packet) -> ConnectionHandle {
        let sender = self.inbox.clone();
        let reader_inbox = self.inbox.clone();
        thread::Builder::new()
            .name("RdpPacketReader".to_owned())
            .spawn(move || read_packets(source, reader_inbox))
            .expect("Thread spawning failed");
        let thread = thread::Builder::new()
            .name("RdpConnection".to_owned())
            .spawn(move || self.run(greeting))
            .expect("Thread spawning failed");
        ConnectionHandle {
            sender,
            thread: Some(thread),
        }
    }

    fn run(mut self, greeting: Packet) {
        if let Err(error) = self.write(&greeting) {
            warn!("Error writing greeting: {}", error);
            return self.shutdown();
        }

        while let Ok(msg) = self.receiver.recv() {
            let result = match msg {
                ConnectionMsg::Packet(value) => {
                    trace!("-> {}", value);
                    self.handle_packet(value)
                },
                ConnectionMsg::Completed { actor, result } => self.handle_completion(actor, result),
                ConnectionMsg::Debuggee(browser_id, event) => {
                    trace!("debuggee event for browser {}: {:?}", browser_id, event);
                    self.handle_debuggee_event(browser_id, &event)
                },
                ConnectionMsg::Close => break,
            };
            if let Err(error) = result {
                warn!("Error writing to the RDP client: {}", error);
                break;
            }
        }
        self.shutdown();
    }

    fn shutdown(mut self) {
        self.in_flight.clear();
        self.registry.destroy_all();
        self.sink.close();
        info!("RDP connection closed");
    }

    fn write(&mut self, packet: &Packet) -> Result<(), TransportError> {
        self.sink.send_packet(packet)
    }

    fn handle_packet(&mut self, value: Value) -> Result<(), TransportError> {
        let Value::Object(packet) = value else {
            warn!("Received a packet that is not an object: {}", value);
            let error = ProtocolError::new(ErrorCode::MissingParameter, "Packet is not an object");
            return self.write(&packet::error_reply(None, error));
        };
        self.route(packet)
    }

    fn route(&mut self, packet: Packet) -> Result<(), TransportError> {
        let Some(to) = packet::to(&packet).map(str::to_owned) else {
            warn!("Received a packet without 'to': {:?}", packet);
            let error = ProtocolError::new(ErrorCode::MissingParameter, "Missing 'to'");
            return self.write(&packet::error_reply(None, error));
        };
        if let Some(in_flight) = self.in_flight.get_mut(&to) {
            debug!("{} is busy, queueing request", to);
            in_flight.queue.push_back(packet);
            return Ok(());
        }
        self.dispatch(to, packet)
    }

    fn dispatch(&mut self, to: String, packet: Packet) -> Result<(), TransportError> {
        let Some(actor) = self.registry.get(&to) else {
            debug!("message received for unknown actor \"{}\"", to);
            let error =
                ProtocolError::new(ErrorCode::NoSuchActor, format!("No such actor for ID: {to}"));
            return self.write(&error_packet(&to, error));
        };
        let Some(request_type) = packet::packet_type(&packet) else {
            let error = ProtocolError::new(ErrorCode::MissingParameter, "Missing 'type'");
            return self.write(&error_packet(&to, error));
        };
        let Some(method) = actor.spec().method(request_type) else {
            debug!(
                "unexpected message type \"{}\" found for actor \"{}\"",
                request_type, to
            );
            let error = ActorError::UnrecognizedPacketType.to_protocol(&to, request_type);
            return self.write(&error_packet(&to, error));
        };

        let registry = &self.registry;
        let args = match method
            .read_request(&packet, &mut |type_name, value| {
                resolve_actor_id(registry, type_name, value)
            }) {
            Ok(args) => args,
            Err(error) => {
                warn!("Bad '{}' request to {}: {}", method.name(), to, error);
                if method.is_oneway() {
                    return Ok(());
                }
                return self.write(&error_packet(&to, error.to_protocol()));
            },
        };

        let request = ClientRequest::new(to.clone(), method, args, self.inbox.clone());
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            actor.handle_request(request, registry)
        }))
        .unwrap_or_else(|_| {
            Err(ActorError::Internal(format!(
                "{} panicked while handling '{}'",
                to,
                method.name()
            )))
        });

        self.registry.flush_new();
        match result {
            Ok(Reply::Pending) => {
                self.in_flight.insert(
                    to,
                    InFlight {
                        method,
                        queue: VecDeque::new(),
                    },
                );
            },
            Ok(Reply::Ready(fields)) => self.write_reply(&to, method, Ok(fields))?,
            Err(error) => self.write_reply(&to, method, Err(error))?,
        }
        self.flush_events()?;
        self.flush_destroyed()
    }

    fn write_reply(
        &mut self,
        from: &str,
        method: &MethodSpec,
        result: Result<Map<String, Value>, ActorError>,
    ) -> Result<(), TransportError> {
        let registry = &self.registry;
        let reply = result.and_then(|fields| {
            method
                .write_response(from, fields, &mut |type_name, value| {
                    resolve_actor_form(registry, type_name, value)
                })
                .map_err(|error| {
                    ActorError::Internal(format!("reply does not match its spec: {error}"))
                })
        });

        let packet = match reply {
            Ok(packet) => {
                if method.is_release() {
                    self.registry.destroy_later(from);
                }
                packet
            },
            Err(error) => {
                match error {
                    ActorError::Internal(ref details) => {
                        error!("{} failed to handle '{}': {}", from, method.name(), details)
                    },
                    ref other => debug!("{} refused '{}': {}", from, method.name(), other),
                }
                error_packet(from, error.to_protocol(from, method.name()))
            },
        };

        if method.is_oneway() {
            if packet::error(&packet).is_some() {
                warn!("Oneway '{}' to {} failed: {:?}", method.name(), from, packet);
            }
            return Ok(());
        }
        self.write(&packet)
    }

    fn handle_completion(
        &mut self,
        actor: String,
        result: Result<Map<String, Value>, ActorError>,
    ) -> Result<(), TransportError> {
        let Some(in_flight) = self.in_flight.remove(&actor) else {
            debug!("Dropping deferred reply from {}, which is gone", actor);
            return Ok(());
        };
        self.write_reply(&actor, in_flight.method, result)?;
        self.flush_events()?;
        self.flush_destroyed()?;
        for packet in in_flight.queue {
            self.route(packet)?;
        }
        Ok(())
    }

    fn handle_debuggee_event(
        &mut self,
        browser_id: u32,
        event: &DebuggeeEvent,
    ) -> Result<(), TransportError> {
        for name in self.registry.names() {
            let registry = &self.registry;
            let Some(actor) = registry.get(&name) else {
                continue;
            };
            let handled = panic::catch_unwind(AssertUnwindSafe(|| {
                actor.handle_debuggee_event(browser_id, event, registry)
            }));
            if handled.is_err() {
                error!("{} panicked while handling {:?}", name, event);
            }
        }
        self.registry.flush_new();
        self.flush_events()?;
        self.flush_destroyed()
    }

    /// Write the events actors queued, checked against their specs.
    fn flush_events(&mut self) -> Result<(), TransportError> {
        for event in self.registry.take_events() {
            let registry = &self.registry;
            let Some(spec) = registry
                .get(&event.from)
                .and_then(|actor| actor.spec().event(&event.name))
            else {
                error!("{} emitted undeclared event '{}'", event.from, event.name);
                continue;
            };
            let packet = spec.write_event(&event.from, event.fields, &mut |type_name, value| {
                resolve_actor_form(registry, type_name, value)
            });
            match packet {
                Ok(packet) => self.write(&packet)?,
                Err(error) => error!(
                    "'{}' event from {} does not match its spec: {}",
                    event.name, event.from, error
                ),
            }
        }
        Ok(())
    }

    /// Destroy the actors queued for destruction. Requests still waiting on a
    /// destroyed actor are answered with `noSuchActor`.
    fn flush_destroyed(&mut self) -> Result<(), TransportError> {
        for name in self.registry.flush_old() {
            let Some(in_flight) = self.in_flight.remove(&name) else {
                continue;
            };
            let error =
                ProtocolError::new(ErrorCode::NoSuchActor, format!("No such actor for ID: {name}"));
            if !in_flight.method.is_oneway() {
                self.write(&error_packet(&name, error.clone()))?;
            }
            for _ in in_flight.queue {
                self.write(&error_packet(&name, error.clone()))?;
            }
        }
        Ok(())
    }
}

/// Process the input from a single client until EOF.
fn read_packets(mut source: Box<dyn PacketSource>, inbox: Sender<ConnectionMsg>) {
    loop {
        match source.recv_packet() {
            Ok(Some(packet)) => {
                if inbox.send(ConnectionMsg::Packet(packet)).is_err() {
                    break;
                }
            },
            Ok(None) => {
                info!("RDP client closed the connection");
                break;
            },
            Err(error) => {
                error!("Failed to read message from RDP client: {}", error);
                break;
            },
        }
    }
    let _ = inbox.send(ConnectionMsg::Close);
}
