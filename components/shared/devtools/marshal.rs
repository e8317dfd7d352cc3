/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Conversion between call arguments / reply values and packets, checked
//! against a spec.
//!
//! Actor references are the only values whose meaning depends on which end
//! of the connection is looking at them, so every function here takes a
//! callback that resolves a reference of a given actor type. The server uses
//! it to check that the actor exists in its registry; the client uses it to
//! instantiate fronts.

use std::fmt;

use serde_json::{Map, Value};

use crate::error::{ErrorCode, ProtocolError};
use crate::packet::Packet;
use crate::spec::{EventSpec, Field, MethodSpec, ParamRole, TypeTag};

/// Resolves an actor reference `(type_name, value)` into the value that
/// should take its place.
pub type ActorRefFn<'a> = dyn FnMut(&str, &Value) -> Result<Value, MarshalError> + 'a;

static NULL: Value = Value::Null;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MarshalErrorKind {
    Missing,
    BadType { expected: String },
    TooManyArguments { expected: usize, found: usize },
    /// A reply carried a field its spec does not declare.
    Undeclared,
    UnknownActor(String),
    WrongActorType { expected: String, found: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MarshalError {
    pub field: String,
    pub kind: MarshalErrorKind,
}

impl MarshalError {
    pub fn new(field: &str, kind: MarshalErrorKind) -> Self {
        MarshalError {
            field: field.to_owned(),
            kind,
        }
    }

    pub fn bad_type(field: &str, expected: impl fmt::Display) -> Self {
        MarshalError::new(
            field,
            MarshalErrorKind::BadType {
                expected: expected.to_string(),
            },
        )
    }

    pub fn to_protocol(&self) -> ProtocolError {
        let code = match self.kind {
            MarshalErrorKind::Missing => ErrorCode::MissingParameter,
            MarshalErrorKind::UnknownActor(_) => ErrorCode::NoSuchActor,
            _ => ErrorCode::BadParameterType,
        };
        ProtocolError::new(code, self.to_string())
    }
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MarshalErrorKind::Missing => write!(f, "Missing parameter: '{}'", self.field),
            MarshalErrorKind::BadType { expected } => {
                write!(f, "Parameter '{}' should be of type {expected}", self.field)
            },
            MarshalErrorKind::TooManyArguments { expected, found } => write!(
                f,
                "'{}' takes at most {expected} arguments, got {found}",
                self.field
            ),
            MarshalErrorKind::Undeclared => write!(f, "Field '{}' is not declared", self.field),
            MarshalErrorKind::UnknownActor(name) => {
                write!(f, "No such actor for ID: {name} (in '{}')", self.field)
            },
            MarshalErrorKind::WrongActorType { expected, found } => write!(
                f,
                "Parameter '{}' should be a {expected} actor, got {found}",
                self.field
            ),
        }
    }
}

impl std::error::Error for MarshalError {}

/// The actor ID named by a reference, which is either the bare ID or a form
/// object with an `actor` property.
pub fn actor_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(name) => Some(name),
        Value::Object(form) => form.get("actor").and_then(Value::as_str),
        _ => None,
    }
}

/// Check `value` against `tag`, resolving actor references on the way.
pub fn marshal_value(
    tag: &TypeTag,
    field: &str,
    value: &Value,
    actor: &mut ActorRefFn<'_>,
) -> Result<Value, MarshalError> {
    match tag {
        TypeTag::Boolean if value.is_boolean() => Ok(value.clone()),
        TypeTag::String if value.is_string() => Ok(value.clone()),
        TypeTag::Number if value.is_number() => Ok(value.clone()),
        TypeTag::Json => Ok(value.clone()),
        TypeTag::Nullable(_) if value.is_null() => Ok(Value::Null),
        TypeTag::Nullable(inner) => marshal_value(inner, field, value, actor),
        TypeTag::Array(inner) => {
            let Some(items) = value.as_array() else {
                return Err(MarshalError::bad_type(field, tag));
            };
            items
                .iter()
                .enumerate()
                .map(|(index, item)| marshal_value(inner, &format!("{field}[{index}]"), item, actor))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        },
        TypeTag::Actor(type_name) if !value.is_null() => actor(type_name, value).map_err(|error| {
            MarshalError {
                field: field.to_owned(),
                kind: error.kind,
            }
        }),
        _ => Err(MarshalError::bad_type(field, tag)),
    }
}

impl MethodSpec {
    /// Build a request packet from positional arguments.
    pub fn write_request(
        &self,
        to: &str,
        args: &[Value],
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Packet, MarshalError> {
        if args.len() > self.arity() {
            return Err(MarshalError::new(
                self.name(),
                MarshalErrorKind::TooManyArguments {
                    expected: self.arity(),
                    found: args.len(),
                },
            ));
        }

        let mut packet = Map::new();
        packet.insert("to".into(), Value::String(to.to_owned()));
        packet.insert("type".into(), Value::String(self.name().to_owned()));

        for param in self.params() {
            let arg = args.get(param.index).unwrap_or(&NULL);
            let value = match param.role {
                ParamRole::Arg => arg,
                ParamRole::Option => match arg {
                    Value::Null => continue,
                    Value::Object(options) => match options.get(&param.name) {
                        Some(value) if !value.is_null() => value,
                        _ => continue,
                    },
                    _ => return Err(MarshalError::bad_type(&param.name, "object")),
                },
            };
            if value.is_null() {
                if param.tag.accepts_null() {
                    continue;
                }
                return Err(MarshalError::new(&param.name, MarshalErrorKind::Missing));
            }
            let value = marshal_value(&param.tag, &param.name, value, actor)?;
            packet.insert(param.name.clone(), value);
        }
        Ok(packet)
    }

    /// Recover positional arguments from a request packet. Options sharing an
    /// index are gathered back into one object; an options object with no
    /// property present is `null`.
    pub fn read_request(
        &self,
        packet: &Packet,
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Vec<Value>, MarshalError> {
        let mut args = vec![Value::Null; self.arity()];
        for param in self.params() {
            let value = packet.get(&param.name).unwrap_or(&NULL);
            match param.role {
                ParamRole::Arg => {
                    if value.is_null() && !param.tag.accepts_null() {
                        return Err(MarshalError::new(&param.name, MarshalErrorKind::Missing));
                    }
                    args[param.index] = marshal_value(&param.tag, &param.name, value, actor)?;
                },
                ParamRole::Option => {
                    if value.is_null() {
                        continue;
                    }
                    let value = marshal_value(&param.tag, &param.name, value, actor)?;
                    let slot = &mut args[param.index];
                    if !slot.is_object() {
                        *slot = Value::Object(Map::new());
                    }
                    if let Value::Object(options) = slot {
                        options.insert(param.name.clone(), value);
                    }
                },
            }
        }
        Ok(args)
    }

    /// Build a reply packet. Every declared field must be present unless its
    /// type accepts null, and no undeclared field may be present.
    pub fn write_response(
        &self,
        from: &str,
        values: Map<String, Value>,
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Packet, MarshalError> {
        let mut packet = write_fields(self.response(), values, actor)?;
        packet.insert("from".into(), Value::String(from.to_owned()));
        Ok(packet)
    }

    /// Decode a reply packet. Fields the spec does not know are ignored.
    pub fn read_response(
        &self,
        packet: &Packet,
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Map<String, Value>, MarshalError> {
        read_fields(self.response(), packet, actor)
    }
}

impl EventSpec {
    pub fn write_event(
        &self,
        from: &str,
        values: Map<String, Value>,
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Packet, MarshalError> {
        let mut packet = write_fields(self.fields(), values, actor)?;
        packet.insert("from".into(), Value::String(from.to_owned()));
        packet.insert("type".into(), Value::String(self.name().to_owned()));
        Ok(packet)
    }

    pub fn read_event(
        &self,
        packet: &Packet,
        actor: &mut ActorRefFn<'_>,
    ) -> Result<Map<String, Value>, MarshalError> {
        read_fields(self.fields(), packet, actor)
    }
}

fn write_fields(
    fields: &[Field],
    mut values: Map<String, Value>,
    actor: &mut ActorRefFn<'_>,
) -> Result<Packet, MarshalError> {
    let mut packet = Map::new();
    for field in fields {
        let value = values.remove(&field.name).unwrap_or(Value::Null);
        if value.is_null() && !field.tag.accepts_null() {
            return Err(MarshalError::new(&field.name, MarshalErrorKind::Missing));
        }
        let value = marshal_value(&field.tag, &field.name, &value, actor)?;
        packet.insert(field.name.clone(), value);
    }
    if let Some(extra) = values.keys().next() {
        return Err(MarshalError::new(extra, MarshalErrorKind::Undeclared));
    }
    Ok(packet)
}

fn read_fields(
    fields: &[Field],
    packet: &Packet,
    actor: &mut ActorRefFn<'_>,
) -> Result<Map<String, Value>, MarshalError> {
    let mut values = Map::new();
    for field in fields {
        let value = packet.get(&field.name).unwrap_or(&NULL);
        if value.is_null() && !field.tag.accepts_null() {
            return Err(MarshalError::new(&field.name, MarshalErrorKind::Missing));
        }
        let value = marshal_value(&field.tag, &field.name, value, actor)?;
        values.insert(field.name.clone(), value);
    }
    Ok(values)
}
