/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Wire-level pieces of the remote debugging protocol shared by the server
//! and the client: packets, error codes, actor specs, marshaling and
//! transports. Kept in its own crate so that either end can be built without
//! the other.

#![crate_name = "rdp_protocol"]
#![crate_type = "rlib"]
#![deny(unsafe_code)]

use std::sync::LazyLock;

pub mod error;
pub mod marshal;
pub mod packet;
pub mod spec;
/// <https://searchfox.org/mozilla-central/source/devtools/shared/specs>
pub mod specs {
    pub mod root;
    pub mod tab_descriptor;
    pub mod watcher;
    pub mod window_global;
}
pub mod transport;

pub use crate::error::{ErrorCode, ProtocolError};
pub use crate::marshal::{MarshalError, MarshalErrorKind, actor_id};
pub use crate::packet::{EmptyReplyMsg, Packet};
pub use crate::spec::{
    ActorDescription, ActorSpec, EventSpec, MethodSpec, SpecRegistry, SpecValidationError, TypeTag,
};
pub use crate::transport::{PacketSink, PacketSource, TransportError};

/// Register the specs of every built-in actor. Referenced types come first.
pub fn register_builtin_specs(registry: &mut SpecRegistry) -> Result<(), SpecValidationError> {
    specs::window_global::register(registry)?;
    specs::watcher::register(registry)?;
    specs::tab_descriptor::register(registry)?;
    specs::root::register(registry)
}

/// The specs of the built-in actors, shared by every connection in the
/// process.
pub static SPECS: LazyLock<SpecRegistry> = LazyLock::new(|| {
    let mut registry = SpecRegistry::new();
    register_builtin_specs(&mut registry).expect("Built-in actor specs are invalid");
    registry
});

/// Look up a built-in spec by type name.
pub fn builtin_spec(type_name: &str) -> &'static ActorSpec {
    match SPECS.get(type_name) {
        Some(spec) => spec,
        None => panic!("no built-in actor spec for '{type_name}'"),
    }
}
