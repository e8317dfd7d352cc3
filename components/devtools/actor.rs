/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! General actor system infrastructure.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_channel::Sender;
use log::{debug, warn};
use rdp_protocol::{ActorSpec, ErrorCode, MethodSpec, Packet, ProtocolError};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::connection::ConnectionMsg;
use crate::debuggee::{DebuggeeError, DebuggeeEvent};

/// Actor IDs are unique across every connection of the process.
static NEXT_ACTOR_ID: AtomicU32 = AtomicU32::new(0);

/// Create a unique name based on a monotonically increasing suffix.
pub(crate) fn new_name(prefix: &str) -> String {
    let suffix = NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}{}", prefix, suffix)
}

/// A failure while handling a request. Every variant is turned into an error
/// reply; none of them takes the connection down.
#[derive(Debug)]
pub(crate) enum ActorError {
    BadParameterType(String),
    UnrecognizedPacketType,
    WrongState(String),
    /// The debuggee refused the operation with its own error code.
    Debuggee(DebuggeeError),
    /// Anything else. Details are logged, never sent.
    Internal(String),
}

impl ActorError {
    pub(crate) fn to_protocol(&self, actor: &str, request_type: &str) -> ProtocolError {
        match self {
            ActorError::BadParameterType(message) => {
                ProtocolError::new(ErrorCode::BadParameterType, message.clone())
            },
            ActorError::UnrecognizedPacketType => ProtocolError::new(
                ErrorCode::UnrecognizedPacketType,
                format!("Actor {actor} does not recognize the packet type '{request_type}'"),
            ),
            ActorError::WrongState(message) => {
                ProtocolError::new(ErrorCode::WrongState, message.clone())
            },
            ActorError::Debuggee(error) => {
                ProtocolError::new(ErrorCode::from(error.code.as_str()), error.message.clone())
            },
            ActorError::Internal(_) => ProtocolError::new(
                ErrorCode::UnknownError,
                format!("error occurred while processing '{request_type}'"),
            ),
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorError::BadParameterType(message) => write!(f, "bad parameter: {message}"),
            ActorError::UnrecognizedPacketType => f.write_str("unrecognized packet type"),
            ActorError::WrongState(message) => write!(f, "wrong state: {message}"),
            ActorError::Debuggee(error) => write!(f, "debuggee: {error}"),
            ActorError::Internal(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ActorError {}

impl From<DebuggeeError> for ActorError {
    fn from(error: DebuggeeError) -> Self {
        ActorError::Debuggee(error)
    }
}

/// What a handler produces for a request.
pub(crate) enum Reply {
    /// The reply fields, checked against the method's response spec before
    /// being sent.
    Ready(Map<String, Value>),
    /// The reply will come through a [`DeferredReply`]. Later requests to the
    /// same actor wait until it does.
    Pending,
}

impl Reply {
    pub(crate) fn empty() -> Reply {
        Reply::Ready(Map::new())
    }

    pub(crate) fn from_msg<T: Serialize>(msg: &T) -> Result<Reply, ActorError> {
        rdp_protocol::packet::to_packet(msg)
            .map(Reply::Ready)
            .map_err(|error| ActorError::Internal(format!("unserializable reply: {error}")))
    }
}

/// A request that passed validation against the actor's spec.
pub(crate) struct ClientRequest {
    pub method: &'static MethodSpec,
    /// Positional arguments. Option groups are objects, or null if the client
    /// sent none of their properties.
    pub args: Vec<Value>,
    actor: String,
    inbox: Sender<ConnectionMsg>,
}

impl ClientRequest {
    pub(crate) fn new(
        actor: String,
        method: &'static MethodSpec,
        args: Vec<Value>,
        inbox: Sender<ConnectionMsg>,
    ) -> Self {
        ClientRequest {
            method,
            args,
            actor,
            inbox,
        }
    }

    pub(crate) fn method_name(&self) -> &str {
        self.method.name()
    }

    /// The positional argument at `index`.
    pub(crate) fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ActorError> {
        let value = self.args.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|error| ActorError::BadParameterType(format!("argument {index}: {error}")))
    }

    /// The property `name` of the options object at `index`, if the client
    /// sent it.
    pub(crate) fn option<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, ActorError> {
        match self.args.get(index).and_then(|options| options.get(name)) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|error| ActorError::BadParameterType(format!("'{name}': {error}"))),
        }
    }

    /// Answer this request later, possibly from another thread.
    pub(crate) fn defer(self) -> (Reply, DeferredReply) {
        let deferred = DeferredReply {
            actor: self.actor,
            inbox: Some(self.inbox),
        };
        (Reply::Pending, deferred)
    }
}

/// The promise of a reply to a request that returned [`Reply::Pending`].
/// Dropping it unresolved answers the request with `unknownError`.
pub(crate) struct DeferredReply {
    actor: String,
    inbox: Option<Sender<ConnectionMsg>>,
}

impl DeferredReply {
    pub(crate) fn resolve(mut self, result: Result<Map<String, Value>, ActorError>) {
        self.complete(result);
    }

    pub(crate) fn resolve_msg<T: Serialize>(self, msg: &T) {
        let result = rdp_protocol::packet::to_packet(msg)
            .map_err(|error| ActorError::Internal(format!("unserializable reply: {error}")));
        self.resolve(result);
    }

    fn complete(&mut self, result: Result<Map<String, Value>, ActorError>) {
        if let Some(inbox) = self.inbox.take() {
            let msg = ConnectionMsg::Completed {
                actor: mem::take(&mut self.actor),
                result,
            };
            if inbox.send(msg).is_err() {
                debug!("Connection closed before a deferred reply was sent");
            }
        }
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if self.inbox.is_some() {
            warn!("Deferred reply for {} dropped without a value", self.actor);
            self.complete(Err(ActorError::Internal(
                "deferred reply dropped".to_owned(),
            )));
        }
    }
}

/// A common trait for all actors that encompasses an immutable name, the spec
/// its requests are checked against, and the ability to process requests
/// that are directed to it.
pub(crate) trait Actor: Any + ActorAsAny + Send {
    fn name(&self) -> String;

    fn spec(&self) -> &'static ActorSpec;

    fn handle_request(
        &self,
        request: ClientRequest,
        registry: &ActorRegistry,
    ) -> Result<Reply, ActorError>;

    /// How the actor is described when a reply or event references it.
    fn form(&self) -> Value {
        json!({ "actor": self.name() })
    }

    fn handle_debuggee_event(
        &self,
        _browser_id: u32,
        _event: &DebuggeeEvent,
        _registry: &ActorRegistry,
    ) {
    }

    /// Called once when the actor is destroyed.
    fn cleanup(&self) {}
}

pub(crate) trait ActorAsAny {
    fn actor_as_any(&self) -> &dyn Any;
}

impl<T: Actor> ActorAsAny for T {
    fn actor_as_any(&self) -> &dyn Any {
        self
    }
}

/// An event queued by an actor, written once the current request is done.
pub(crate) struct PendingEvent {
    pub from: String,
    pub name: String,
    pub fields: Map<String, Value>,
}

/// The actors of one connection. Actors created by another actor are its
/// children and go away with it.
#[derive(Default)]
pub(crate) struct ActorRegistry {
    actors: FxHashMap<String, Box<dyn Actor>>,
    children: FxHashMap<String, Vec<String>>,
    new_actors: RefCell<Vec<(Option<String>, Box<dyn Actor>)>>,
    old_actors: RefCell<Vec<String>>,
    events: RefCell<Vec<PendingEvent>>,
}

impl ActorRegistry {
    pub(crate) fn new() -> ActorRegistry {
        Self::default()
    }

    /// Add an actor to the registry of known actors that can receive messages.
    pub(crate) fn register(&mut self, actor: Box<dyn Actor>) {
        debug!("registering {}", actor.name());
        self.actors.insert(actor.name(), actor);
    }

    pub(crate) fn register_child_later(&self, parent: &str, actor: Box<dyn Actor>) {
        self.new_actors
            .borrow_mut()
            .push((Some(parent.to_owned()), actor));
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.actors.contains_key(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&dyn Actor> {
        self.actors.get(name).map(|actor| &**actor)
    }

    /// Find an actor by registered name.
    pub(crate) fn find<'a, T: Any>(&'a self, name: &str) -> Option<&'a T> {
        self.actors
            .get(name)
            .and_then(|actor| actor.actor_as_any().downcast_ref::<T>())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.actors.keys().cloned().collect()
    }

    /// Queue an event from `from`. It is checked against the actor's spec
    /// when written.
    pub(crate) fn emit_later<T: Serialize>(&self, from: &str, name: &str, payload: &T) {
        match rdp_protocol::packet::to_packet(payload) {
            Ok(fields) => self.events.borrow_mut().push(PendingEvent {
                from: from.to_owned(),
                name: name.to_owned(),
                fields,
            }),
            Err(error) => warn!("Dropping unserializable {} event from {}: {}", name, from, error),
        }
    }

    pub(crate) fn take_events(&self) -> Vec<PendingEvent> {
        mem::take(&mut *self.events.borrow_mut())
    }

    pub(crate) fn destroy_later(&self, name: &str) {
        self.old_actors.borrow_mut().push(name.to_owned());
    }

    /// Register the actors created during the last request.
    pub(crate) fn flush_new(&mut self) {
        let new_actors = mem::take(&mut *self.new_actors.borrow_mut());
        for (parent, actor) in new_actors {
            if let Some(parent) = parent {
                if !self.actors.contains_key(&parent) {
                    debug!("parent {} of {} is gone", parent, actor.name());
                    actor.cleanup();
                    continue;
                }
                self.children.entry(parent).or_default().push(actor.name());
            }
            self.register(actor);
        }
    }

    /// Destroy the actors queued with [`destroy_later`](Self::destroy_later).
    /// Returns the names of every actor that went away.
    pub(crate) fn flush_old(&mut self) -> Vec<String> {
        let old_actors = mem::take(&mut *self.old_actors.borrow_mut());
        let mut destroyed = vec![];
        for name in old_actors {
            destroyed.extend(self.destroy(&name));
        }
        destroyed
    }

    /// Destroy an actor and its descendants. Destroying an actor that is
    /// already gone does nothing.
    pub(crate) fn destroy(&mut self, name: &str) -> Vec<String> {
        let mut destroyed = vec![];
        let mut stack = vec![name.to_owned()];
        while let Some(name) = stack.pop() {
            if let Some(children) = self.children.remove(&name) {
                stack.extend(children);
            }
            if let Some(actor) = self.actors.remove(&name) {
                debug!("destroying {}", name);
                actor.cleanup();
                destroyed.push(name);
            }
        }
        for children in self.children.values_mut() {
            children.retain(|child| !destroyed.contains(child));
        }
        destroyed
    }

    /// Destroy every actor. Used when the connection goes away.
    pub(crate) fn destroy_all(&mut self) {
        self.children.clear();
        for (_, actor) in self.actors.drain() {
            actor.cleanup();
        }
    }
}

/// Turn an actor reference found in a request into the actor's ID, checking
/// that the actor exists and has the expected type.
pub(crate) fn resolve_actor_id(
    registry: &ActorRegistry,
    type_name: &str,
    value: &Value,
) -> Result<Value, rdp_protocol::MarshalError> {
    use rdp_protocol::{MarshalError, MarshalErrorKind};

    let Some(name) = rdp_protocol::actor_id(value) else {
        return Err(MarshalError::bad_type("", type_name));
    };
    match registry.get(name) {
        None => Err(MarshalError::new(
            "",
            MarshalErrorKind::UnknownActor(name.to_owned()),
        )),
        Some(actor) if actor.spec().type_name() != type_name => Err(MarshalError::new(
            "",
            MarshalErrorKind::WrongActorType {
                expected: type_name.to_owned(),
                found: actor.spec().type_name().to_owned(),
            },
        )),
        Some(_) => Ok(Value::String(name.to_owned())),
    }
}

/// Turn an actor reference found in a reply or event into the actor's form.
pub(crate) fn resolve_actor_form(
    registry: &ActorRegistry,
    type_name: &str,
    value: &Value,
) -> Result<Value, rdp_protocol::MarshalError> {
    resolve_actor_id(registry, type_name, value)?;
    match rdp_protocol::actor_id(value).and_then(|name| registry.get(name)) {
        Some(actor) => Ok(actor.form()),
        None => Ok(value.clone()),
    }
}

/// An error reply for a packet addressed to `actor`.
pub(crate) fn error_packet(actor: &str, error: ProtocolError) -> Packet {
    rdp_protocol::packet::error_reply(Some(actor), error)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// An actor that only counts how often it is cleaned up.
    pub(crate) struct Leaf {
        pub name: String,
        pub cleanups: Arc<AtomicUsize>,
    }

    impl Actor for Leaf {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn spec(&self) -> &'static ActorSpec {
            rdp_protocol::builtin_spec("windowGlobalTarget")
        }

        fn handle_request(
            &self,
            _request: ClientRequest,
            _registry: &ActorRegistry,
        ) -> Result<Reply, ActorError> {
            Ok(Reply::empty())
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leaf(name: &str, cleanups: &Arc<AtomicUsize>) -> Box<dyn Actor> {
        Box::new(Leaf {
            name: name.to_owned(),
            cleanups: cleanups.clone(),
        })
    }

    #[test]
    fn names_are_never_reused() {
        let a = new_name("tab");
        let b = new_name("tab");
        assert_ne!(a, b);
        assert!(a.starts_with("tab"));
    }

    #[test]
    fn destroying_a_parent_destroys_its_descendants() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut registry = ActorRegistry::new();
        registry.register(leaf("parent", &cleanups));
        registry.register_child_later("parent", leaf("child", &cleanups));
        registry.flush_new();
        registry.register_child_later("child", leaf("grandchild", &cleanups));
        registry.register(leaf("sibling", &cleanups));
        registry.flush_new();
        assert!(registry.find::<Leaf>("grandchild").is_some());

        let mut destroyed = registry.destroy("parent");
        destroyed.sort();
        assert_eq!(destroyed, ["child", "grandchild", "parent"]);
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
        assert!(registry.contains("sibling"));
        assert!(!registry.contains("grandchild"));
    }

    #[test]
    fn destroy_is_idempotent() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut registry = ActorRegistry::new();
        registry.register(leaf("tab1", &cleanups));

        registry.destroy_later("tab1");
        registry.destroy_later("tab1");
        assert_eq!(registry.flush_old(), ["tab1"]);
        assert!(registry.destroy("tab1").is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!registry.contains("tab1"));
    }

    #[test]
    fn children_of_a_destroyed_parent_are_not_registered() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut registry = ActorRegistry::new();
        registry.register_child_later("gone", leaf("orphan", &cleanups));
        registry.flush_new();
        assert!(!registry.contains("orphan"));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn actor_references_are_checked() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut registry = ActorRegistry::new();
        registry.register(leaf("target1", &cleanups));

        assert_eq!(
            resolve_actor_id(&registry, "windowGlobalTarget", &json!({"actor": "target1"})).unwrap(),
            json!("target1")
        );
        assert_eq!(
            resolve_actor_form(&registry, "windowGlobalTarget", &json!("target1")).unwrap(),
            json!({"actor": "target1"})
        );
        let error = resolve_actor_id(&registry, "watcher", &json!("target1")).unwrap_err();
        assert!(matches!(
            error.kind,
            rdp_protocol::MarshalErrorKind::WrongActorType { .. }
        ));
        let error = resolve_actor_id(&registry, "watcher", &json!("watcher9")).unwrap_err();
        assert_eq!(error.to_protocol().error, ErrorCode::NoSuchActor);
    }
}
