/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Declarative actor specs.
//!
//! A spec names an actor type and lists its methods and events, with the
//! marshaling role and type of every request parameter and reply field. The
//! same spec drives the server's dispatch table and the client's call stubs,
//! so the two ends can never disagree about the shape of a packet.
//! See <https://searchfox.org/mozilla-central/source/devtools/shared/specs>.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map, Value};

/// The type of a parameter or reply field.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TypeTag {
    Boolean,
    String,
    Number,
    /// Any JSON value, passed through untouched.
    Json,
    Nullable(Box<TypeTag>),
    Array(Box<TypeTag>),
    /// A reference to an actor of the given type name.
    Actor(String),
}

impl TypeTag {
    /// Parse a tag such as `"boolean"`, `"nullable:string"`,
    /// `"array:tabDescriptor"`. Anything that is not a primitive is taken to
    /// be an actor type name; whether that type exists is checked when the
    /// spec is registered.
    pub fn parse(tag: &str) -> TypeTag {
        if let Some(inner) = tag.strip_prefix("nullable:") {
            return TypeTag::Nullable(Box::new(TypeTag::parse(inner)));
        }
        if let Some(inner) = tag.strip_prefix("array:") {
            return TypeTag::Array(Box::new(TypeTag::parse(inner)));
        }
        match tag {
            "boolean" => TypeTag::Boolean,
            "string" => TypeTag::String,
            "number" => TypeTag::Number,
            "json" => TypeTag::Json,
            name => TypeTag::Actor(name.to_owned()),
        }
    }

    /// Whether a missing value is acceptable for this type.
    pub fn accepts_null(&self) -> bool {
        matches!(self, TypeTag::Nullable(_) | TypeTag::Json)
    }

    fn actor_types<'a>(&'a self, types: &mut Vec<&'a str>) {
        match self {
            TypeTag::Nullable(inner) | TypeTag::Array(inner) => inner.actor_types(types),
            TypeTag::Actor(name) => types.push(name),
            _ => {},
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Boolean => f.write_str("boolean"),
            TypeTag::String => f.write_str("string"),
            TypeTag::Number => f.write_str("number"),
            TypeTag::Json => f.write_str("json"),
            TypeTag::Nullable(inner) => write!(f, "nullable:{inner}"),
            TypeTag::Array(inner) => write!(f, "array:{inner}"),
            TypeTag::Actor(name) => f.write_str(name),
        }
    }
}

/// How a request parameter travels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamRole {
    /// The positional argument at `index` is written verbatim under the
    /// parameter's name.
    Arg,
    /// The positional argument at `index` is an options object; the property
    /// with the parameter's name is copied into the packet if present.
    Option,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub role: ParamRole,
    pub index: usize,
    pub tag: TypeTag,
}

/// A named, typed field of a reply or event.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub tag: TypeTag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MethodSpec {
    name: String,
    params: Vec<Param>,
    response: Vec<Field>,
    oneway: bool,
    release: bool,
}

impl MethodSpec {
    pub fn new(name: &str) -> Self {
        MethodSpec {
            name: name.to_owned(),
            params: vec![],
            response: vec![],
            oneway: false,
            release: false,
        }
    }

    /// `Arg(index, tag)` stored under `name`.
    pub fn arg(mut self, name: &str, index: usize, tag: &str) -> Self {
        self.params.push(Param {
            name: name.to_owned(),
            role: ParamRole::Arg,
            index,
            tag: TypeTag::parse(tag),
        });
        self
    }

    /// `Option(index, tag)` stored under `name`.
    pub fn option(mut self, name: &str, index: usize, tag: &str) -> Self {
        self.params.push(Param {
            name: name.to_owned(),
            role: ParamRole::Option,
            index,
            tag: TypeTag::parse(tag),
        });
        self
    }

    /// `RetVal(tag)` stored under `name` in the reply.
    pub fn retval(mut self, name: &str, tag: &str) -> Self {
        self.response.push(Field {
            name: name.to_owned(),
            tag: TypeTag::parse(tag),
        });
        self
    }

    /// Fire-and-forget: the actor sends no reply.
    pub fn oneway(mut self) -> Self {
        self.oneway = true;
        self
    }

    /// The actor is destroyed once it has replied.
    pub fn release(mut self) -> Self {
        self.release = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn response(&self) -> &[Field] {
        &self.response
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn is_release(&self) -> bool {
        self.release
    }

    /// Number of positional arguments a caller may pass.
    pub fn arity(&self) -> usize {
        self.params
            .iter()
            .map(|param| param.index + 1)
            .max()
            .unwrap_or(0)
    }

    fn request_template(&self) -> Value {
        let mut template = Map::new();
        template.insert("type".into(), Value::String(self.name.clone()));
        for param in &self.params {
            let key = match param.role {
                ParamRole::Arg => "_arg",
                ParamRole::Option => "_option",
            };
            let mut entry = Map::new();
            entry.insert(key.into(), Value::from(param.index));
            entry.insert("type".into(), Value::String(param.tag.to_string()));
            template.insert(param.name.clone(), Value::Object(entry));
        }
        Value::Object(template)
    }

    fn response_template(&self) -> Value {
        if self.oneway {
            return Value::Null;
        }
        let mut template = Map::new();
        for field in &self.response {
            let mut entry = Map::new();
            entry.insert("_retval".into(), Value::String(field.tag.to_string()));
            template.insert(field.name.clone(), Value::Object(entry));
        }
        Value::Object(template)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventSpec {
    name: String,
    fields: Vec<Field>,
}

impl EventSpec {
    pub fn new(name: &str) -> Self {
        EventSpec {
            name: name.to_owned(),
            fields: vec![],
        }
    }

    pub fn field(mut self, name: &str, tag: &str) -> Self {
        self.fields.push(Field {
            name: name.to_owned(),
            tag: TypeTag::parse(tag),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

/// A validated, immutable actor spec.
#[derive(Debug, PartialEq)]
pub struct ActorSpec {
    type_name: String,
    methods: Vec<MethodSpec>,
    events: Vec<EventSpec>,
}

impl ActorSpec {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|method| method.name == name)
    }

    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    pub fn event(&self, name: &str) -> Option<&EventSpec> {
        self.events.iter().find(|event| event.name == name)
    }

    pub fn events(&self) -> &[EventSpec] {
        &self.events
    }

    pub fn description(&self) -> ActorDescription {
        ActorDescription {
            category: "actor",
            type_name: self.type_name.clone(),
            methods: self
                .methods
                .iter()
                .map(|method| Method {
                    name: method.name.clone(),
                    request: method.request_template(),
                    response: method.response_template(),
                })
                .collect(),
            events: self
                .events
                .iter()
                .map(|event| {
                    let fields = event
                        .fields
                        .iter()
                        .map(|field| (field.name.clone(), Value::String(field.tag.to_string())))
                        .collect();
                    (event.name.clone(), Value::Object(fields))
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDescription {
    pub category: &'static str,
    pub type_name: String,
    pub methods: Vec<Method>,
    pub events: BTreeMap<String, Value>,
}

#[derive(Serialize)]
pub struct Method {
    pub name: String,
    pub request: Value,
    pub response: Value,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpecValidationError {
    DuplicateType(String),
    DuplicateMethod(String),
    DuplicateEvent(String),
    /// The same packet field is declared twice in one method or event.
    DuplicateField { owner: String, field: String },
    /// A field uses a name the packet envelope already uses.
    ReservedField { owner: String, field: String },
    /// Two `Arg`s, or an `Arg` and an `Option`, claim the same index.
    IndexCollision { method: String, index: usize },
    /// Positional indices must be `0..n` with no holes.
    NonContiguousArguments { method: String, missing: usize },
    UnknownType { owner: String, tag: String },
}

impl fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecValidationError::DuplicateType(name) => {
                write!(f, "actor type '{name}' is already registered")
            },
            SpecValidationError::DuplicateMethod(name) => {
                write!(f, "method '{name}' is declared twice")
            },
            SpecValidationError::DuplicateEvent(name) => {
                write!(f, "event '{name}' is declared twice")
            },
            SpecValidationError::DuplicateField { owner, field } => {
                write!(f, "'{owner}' declares field '{field}' twice")
            },
            SpecValidationError::ReservedField { owner, field } => {
                write!(f, "'{owner}' uses reserved field name '{field}'")
            },
            SpecValidationError::IndexCollision { method, index } => {
                write!(f, "'{method}' has more than one argument at index {index}")
            },
            SpecValidationError::NonContiguousArguments { method, missing } => {
                write!(f, "'{method}' has no argument at index {missing}")
            },
            SpecValidationError::UnknownType { owner, tag } => {
                write!(f, "'{owner}' uses unknown type '{tag}'")
            },
        }
    }
}

impl std::error::Error for SpecValidationError {}

/// The set of actor specs known to a process. Actor types referenced by a
/// spec must be registered before it, or be the spec's own type.
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: FxHashMap<String, ActorSpec>,
}

impl SpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_name: &str) -> Option<&ActorSpec> {
        self.specs.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.specs.contains_key(type_name)
    }

    /// Every registered spec, ordered by type name.
    pub fn specs(&self) -> impl Iterator<Item = &ActorSpec> {
        let mut specs: Vec<_> = self.specs.values().collect();
        specs.sort_by(|a, b| a.type_name.cmp(&b.type_name));
        specs.into_iter()
    }

    /// Validate and register a spec.
    pub fn generate_actor_spec(
        &mut self,
        type_name: &str,
        methods: Vec<MethodSpec>,
        events: Vec<EventSpec>,
    ) -> Result<&ActorSpec, SpecValidationError> {
        if self.specs.contains_key(type_name) {
            return Err(SpecValidationError::DuplicateType(type_name.to_owned()));
        }

        let mut method_names = BTreeSet::new();
        for method in &methods {
            if !method_names.insert(method.name.as_str()) {
                return Err(SpecValidationError::DuplicateMethod(method.name.clone()));
            }
            self.validate_method(type_name, method)?;
        }

        let mut event_names = BTreeSet::new();
        for event in &events {
            if !event_names.insert(event.name.as_str()) {
                return Err(SpecValidationError::DuplicateEvent(event.name.clone()));
            }
            self.validate_fields(type_name, &event.name, &event.fields, &["from", "type"])?;
        }

        let spec = ActorSpec {
            type_name: type_name.to_owned(),
            methods,
            events,
        };
        Ok(self.specs.entry(type_name.to_owned()).or_insert(spec))
    }

    fn validate_method(
        &self,
        type_name: &str,
        method: &MethodSpec,
    ) -> Result<(), SpecValidationError> {
        let mut names = BTreeSet::new();
        for param in &method.params {
            if matches!(param.name.as_str(), "to" | "type") {
                return Err(SpecValidationError::ReservedField {
                    owner: method.name.clone(),
                    field: param.name.clone(),
                });
            }
            if !names.insert(param.name.as_str()) {
                return Err(SpecValidationError::DuplicateField {
                    owner: method.name.clone(),
                    field: param.name.clone(),
                });
            }
            self.validate_tag(type_name, &method.name, &param.tag)?;
        }

        // Each index is claimed by exactly one Arg, or by any number of
        // Options sharing one options object.
        let mut claims: BTreeMap<usize, ParamRole> = BTreeMap::new();
        for param in &method.params {
            match (claims.get(&param.index), param.role) {
                (None, role) => {
                    claims.insert(param.index, role);
                },
                (Some(ParamRole::Option), ParamRole::Option) => {},
                (Some(_), _) => {
                    return Err(SpecValidationError::IndexCollision {
                        method: method.name.clone(),
                        index: param.index,
                    });
                },
            }
        }
        if let Some(missing) = (0..method.arity()).find(|index| !claims.contains_key(index)) {
            return Err(SpecValidationError::NonContiguousArguments {
                method: method.name.clone(),
                missing,
            });
        }

        self.validate_fields(type_name, &method.name, &method.response, &["from", "error"])
    }

    fn validate_fields(
        &self,
        type_name: &str,
        owner: &str,
        fields: &[Field],
        reserved: &[&str],
    ) -> Result<(), SpecValidationError> {
        let mut names = BTreeSet::new();
        for field in fields {
            if reserved.contains(&field.name.as_str()) {
                return Err(SpecValidationError::ReservedField {
                    owner: owner.to_owned(),
                    field: field.name.clone(),
                });
            }
            if !names.insert(field.name.as_str()) {
                return Err(SpecValidationError::DuplicateField {
                    owner: owner.to_owned(),
                    field: field.name.clone(),
                });
            }
            self.validate_tag(type_name, owner, &field.tag)?;
        }
        Ok(())
    }

    fn validate_tag(
        &self,
        type_name: &str,
        owner: &str,
        tag: &TypeTag,
    ) -> Result<(), SpecValidationError> {
        let mut actor_types = vec![];
        tag.actor_types(&mut actor_types);
        match actor_types
            .into_iter()
            .find(|name| *name != type_name && !self.specs.contains_key(*name))
        {
            Some(_) => Err(SpecValidationError::UnknownType {
                owner: owner.to_owned(),
                tag: tag.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_nested_tags() {
        assert_eq!(
            TypeTag::parse("nullable:array:tabDescriptor"),
            TypeTag::Nullable(Box::new(TypeTag::Array(Box::new(TypeTag::Actor(
                "tabDescriptor".into()
            )))))
        );
        assert_eq!(
            TypeTag::parse("nullable:array:tabDescriptor").to_string(),
            "nullable:array:tabDescriptor"
        );
    }

    #[test]
    fn rejects_duplicate_method_names() {
        let mut registry = SpecRegistry::new();
        let result = registry.generate_actor_spec(
            "thing",
            vec![MethodSpec::new("ping"), MethodSpec::new("ping")],
            vec![],
        );
        assert_eq!(
            result.unwrap_err(),
            SpecValidationError::DuplicateMethod("ping".into())
        );
        assert!(!registry.contains("thing"));
    }

    #[test]
    fn rejects_holes_in_argument_indices() {
        let mut registry = SpecRegistry::new();
        let result = registry.generate_actor_spec(
            "thing",
            vec![
                MethodSpec::new("set")
                    .arg("key", 0, "string")
                    .arg("value", 2, "json"),
            ],
            vec![],
        );
        assert_eq!(
            result.unwrap_err(),
            SpecValidationError::NonContiguousArguments {
                method: "set".into(),
                missing: 1,
            }
        );
    }

    #[test]
    fn rejects_index_collisions() {
        let mut registry = SpecRegistry::new();
        let result = registry.generate_actor_spec(
            "thing",
            vec![
                MethodSpec::new("set")
                    .arg("key", 0, "string")
                    .option("force", 0, "boolean"),
            ],
            vec![],
        );
        assert_eq!(
            result.unwrap_err(),
            SpecValidationError::IndexCollision {
                method: "set".into(),
                index: 0,
            }
        );
    }

    #[test]
    fn options_may_share_an_index() {
        let mut registry = SpecRegistry::new();
        let spec = registry
            .generate_actor_spec(
                "thing",
                vec![
                    MethodSpec::new("configure")
                        .option("a", 0, "boolean")
                        .option("b", 0, "string"),
                ],
                vec![],
            )
            .unwrap();
        assert_eq!(spec.method("configure").unwrap().arity(), 1);
    }

    #[test]
    fn rejects_unknown_actor_types() {
        let mut registry = SpecRegistry::new();
        let result = registry.generate_actor_spec(
            "thing",
            vec![MethodSpec::new("getOther").retval("other", "array:other")],
            vec![],
        );
        assert_eq!(
            result.unwrap_err(),
            SpecValidationError::UnknownType {
                owner: "getOther".into(),
                tag: "array:other".into(),
            }
        );

        registry
            .generate_actor_spec("other", vec![], vec![])
            .unwrap();
        registry
            .generate_actor_spec(
                "thing",
                vec![
                    MethodSpec::new("getOther").retval("other", "array:other"),
                    MethodSpec::new("getSelf").retval("me", "thing"),
                ],
                vec![],
            )
            .unwrap();
    }

    #[test]
    fn rejects_reserved_and_duplicate_fields() {
        let mut registry = SpecRegistry::new();
        assert!(matches!(
            registry.generate_actor_spec(
                "thing",
                vec![MethodSpec::new("m").arg("to", 0, "string")],
                vec![],
            ),
            Err(SpecValidationError::ReservedField { .. })
        ));
        assert!(matches!(
            registry.generate_actor_spec(
                "thing",
                vec![],
                vec![EventSpec::new("e").field("x", "string").field("x", "json")],
            ),
            Err(SpecValidationError::DuplicateField { .. })
        ));
        assert!(matches!(
            registry.generate_actor_spec("thing", vec![], vec![EventSpec::new("e"), EventSpec::new("e")]),
            Err(SpecValidationError::DuplicateEvent(_))
        ));
    }

    #[test]
    fn rejects_duplicate_types() {
        let mut registry = SpecRegistry::new();
        registry.generate_actor_spec("thing", vec![], vec![]).unwrap();
        assert_eq!(
            registry.generate_actor_spec("thing", vec![], vec![]).unwrap_err(),
            SpecValidationError::DuplicateType("thing".into())
        );
    }

    #[test]
    fn describes_methods_like_firefox() {
        let mut registry = SpecRegistry::new();
        let spec = registry
            .generate_actor_spec(
                "device",
                vec![
                    MethodSpec::new("getDescription").retval("value", "json"),
                    MethodSpec::new("screenshot")
                        .option("fullpage", 0, "boolean")
                        .oneway(),
                ],
                vec![],
            )
            .unwrap();
        let description = serde_json::to_value(spec.description()).unwrap();
        assert_eq!(description["typeName"], "device");
        assert_eq!(
            description["methods"][0]["response"],
            json!({"value": {"_retval": "json"}})
        );
        assert_eq!(
            description["methods"][1]["request"],
            json!({"type": "screenshot", "fullpage": {"_option": 0, "type": "boolean"}})
        );
        assert_eq!(description["methods"][1]["response"], Value::Null);
    }
}
