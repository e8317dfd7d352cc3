/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The watcher is the main entry point when debugging an element. Right now
//! only web views are supported. It talks to the descriptor to get the
//! target of its tab and notifies the client about targets and resources as
//! they come and go.
//!
//! <https://searchfox.org/mozilla-central/source/devtools/server/actors/watcher.js>

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;
use rdp_protocol::{ActorSpec, builtin_spec};
use serde::Serialize;
use serde_json::{Value, json};

use crate::actor::{Actor, ActorError, ActorRegistry, ClientRequest, Reply};
use crate::actors::tab_descriptor::TabDescriptorActor;
use crate::debuggee::Debuggee;

/// The only target type a tab has.
const FRAME_TARGET: &str = "frame";

/// Resource types this watcher can report.
const SUPPORTED_RESOURCES: &[&str] = &["document-event"];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatcherTraits {
    frame: bool,
    process: bool,
    worker: bool,
    resources: BTreeMap<&'static str, bool>,
}

#[derive(Serialize)]
pub(crate) struct WatcherActorMsg {
    actor: String,
    traits: WatcherTraits,
}

#[derive(Serialize)]
struct GetParentBrowsingContextIdReply {
    #[serde(rename = "browsingContextID")]
    browsing_context_id: Option<u64>,
}

#[derive(Serialize)]
struct TargetAvailableMsg<'a> {
    target: &'a str,
}

#[derive(Serialize)]
struct TargetDestroyedMsg {
    target: Value,
}

#[derive(Serialize)]
struct ResourcesAvailableMsg {
    array: Value,
}

pub(crate) struct WatcherActor {
    name: String,
    descriptor: String,
    debuggee: Arc<dyn Debuggee>,
    target_types: RefCell<BTreeSet<String>>,
    resource_types: RefCell<BTreeSet<String>>,
}

impl Actor for WatcherActor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn spec(&self) -> &'static ActorSpec {
        builtin_spec(rdp_protocol::specs::watcher::TYPE_NAME)
    }

    fn form(&self) -> Value {
        serde_json::to_value(self.encodable()).unwrap_or_default()
    }

    fn handle_request(
        &self,
        request: ClientRequest,
        registry: &ActorRegistry,
    ) -> Result<Reply, ActorError> {
        match request.method_name() {
            "watchTargets" => {
                let target_type: String = request.arg(0)?;
                if target_type == FRAME_TARGET {
                    let descriptor = registry
                        .find::<TabDescriptorActor>(&self.descriptor)
                        .ok_or_else(|| ActorError::WrongState("The tab is gone".to_owned()))?;
                    let target = descriptor.ensure_target(registry)?;
                    self.target_types.borrow_mut().insert(target_type);
                    self.target_available(&target, registry);
                } else {
                    debug!("{} has no targets of type {}", self.name, target_type);
                    self.target_types.borrow_mut().insert(target_type);
                }
                Ok(Reply::empty())
            },

            "unwatchTargets" => {
                let target_type: String = request.arg(0)?;
                self.target_types.borrow_mut().remove(&target_type);
                Ok(Reply::empty())
            },

            "watchResources" => {
                let resource_types: Vec<String> = request.arg(0)?;
                if let Some(unsupported) = resource_types
                    .iter()
                    .find(|resource_type| !SUPPORTED_RESOURCES.contains(&resource_type.as_str()))
                {
                    debug!("{} cannot watch {} resources", self.name, unsupported);
                }
                self.resource_types.borrow_mut().extend(resource_types);
                Ok(Reply::empty())
            },

            "unwatchResources" => {
                let resource_types: Vec<String> = request.arg(0)?;
                let mut watched = self.resource_types.borrow_mut();
                for resource_type in &resource_types {
                    watched.remove(resource_type);
                }
                Ok(Reply::empty())
            },

            "getParentBrowsingContextID" => {
                let browsing_context_id: u64 = request.arg(0)?;
                Reply::from_msg(&GetParentBrowsingContextIdReply {
                    browsing_context_id: self.debuggee.parent_browsing_context(browsing_context_id),
                })
            },

            _ => Err(ActorError::UnrecognizedPacketType),
        }
    }
}

impl WatcherActor {
    pub(crate) fn new(name: String, descriptor: String, debuggee: Arc<dyn Debuggee>) -> Self {
        WatcherActor {
            name,
            descriptor,
            debuggee,
            target_types: RefCell::new(BTreeSet::new()),
            resource_types: RefCell::new(BTreeSet::new()),
        }
    }

    pub(crate) fn encodable(&self) -> WatcherActorMsg {
        WatcherActorMsg {
            actor: self.name(),
            traits: WatcherTraits {
                frame: true,
                process: false,
                worker: false,
                resources: SUPPORTED_RESOURCES
                    .iter()
                    .map(|resource_type| (*resource_type, true))
                    .collect(),
            },
        }
    }

    fn watches_frames(&self) -> bool {
        self.target_types.borrow().contains(FRAME_TARGET)
    }

    pub(crate) fn target_available(&self, target: &str, registry: &ActorRegistry) {
        if self.watches_frames() {
            registry.emit_later(
                &self.name,
                "target-available-form",
                &TargetAvailableMsg { target },
            );
        }
    }

    pub(crate) fn target_destroyed(&self, target_form: Value, registry: &ActorRegistry) {
        if self.watches_frames() {
            registry.emit_later(
                &self.name,
                "target-destroyed-form",
                &TargetDestroyedMsg {
                    target: target_form,
                },
            );
        }
    }

    /// Report a document lifecycle event of the tab.
    pub(crate) fn document_event(
        &self,
        name: &str,
        url: &str,
        title: Option<&str>,
        registry: &ActorRegistry,
    ) {
        if !self.resource_types.borrow().contains("document-event") {
            return;
        }
        let mut resource = json!({
            "resourceType": "document-event",
            "name": name,
        });
        match title {
            // "will-navigate" carries the URL being navigated to.
            None => resource["newURI"] = Value::from(url),
            Some(title) => {
                resource["url"] = Value::from(url);
                resource["title"] = Value::from(title);
            },
        }
        registry.emit_later(
            &self.name,
            "resources-available-array",
            &ResourcesAvailableMsg {
                array: json!([["document-event", [resource]]]),
            },
        );
    }
}
