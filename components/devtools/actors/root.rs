/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Liberally derived from the [Firefox JS implementation](https://searchfox.org/mozilla-central/source/devtools/server/actors/root.js).
//! Connection point for all new remote devtools interactions, providing lists
//! of known actors that perform more specific actions (tabs, watchers, ...).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use rdp_protocol::packet::Packet;
use rdp_protocol::{ActorSpec, SPECS, builtin_spec};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::actor::{Actor, ActorError, ActorRegistry, ClientRequest, Reply, new_name};
use crate::actors::tab_descriptor::TabDescriptorActor;
use crate::debuggee::{Debuggee, DebuggeeError, DebuggeeEvent, TabInfo};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActorTraits {
    sources: bool,
    highlightable: bool,
    custom_highlighters: bool,
    network_monitor: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RootActorMsg {
    from: String,
    application_type: String,
    traits: ActorTraits,
}

#[derive(Serialize)]
struct ListTabsReply {
    tabs: Vec<String>,
}

#[derive(Serialize)]
struct GetTabReply {
    tab: String,
}

#[derive(Serialize)]
struct ProtocolDescriptionReply {
    types: BTreeMap<String, Value>,
}

pub(crate) struct RootActor {
    application_type: String,
    debuggee: Arc<dyn Debuggee>,
    /// Descriptor actor for each browser ID handed out so far.
    tabs: RefCell<FxHashMap<u32, String>>,
}

impl Actor for RootActor {
    fn name(&self) -> String {
        "root".to_owned()
    }

    fn spec(&self) -> &'static ActorSpec {
        builtin_spec(rdp_protocol::specs::root::TYPE_NAME)
    }

    fn handle_request(
        &self,
        request: ClientRequest,
        registry: &ActorRegistry,
    ) -> Result<Reply, ActorError> {
        match request.method_name() {
            // https://firefox-source-docs.mozilla.org/devtools/backend/protocol.html#listing-browser-tabs
            "listTabs" => {
                let tabs = self
                    .debuggee
                    .tabs()
                    .into_iter()
                    .map(|tab| self.descriptor_for(tab, registry))
                    .collect();
                Reply::from_msg(&ListTabsReply { tabs })
            },

            "getTab" => {
                let browser_id: Option<u32> = request.option(0, "browserId")?;
                let tab = self
                    .debuggee
                    .tabs()
                    .into_iter()
                    .find(|tab| match browser_id {
                        Some(browser_id) => tab.browser_id == browser_id,
                        None => tab.selected,
                    })
                    .ok_or_else(|| {
                        DebuggeeError::new(
                            "noTab",
                            format!("Unable to find tab with browserId '{browser_id:?}'"),
                        )
                    })?;
                let tab = self.descriptor_for(tab, registry);
                Reply::from_msg(&GetTabReply { tab })
            },

            "protocolDescription" => {
                let types: BTreeMap<String, Value> = SPECS
                    .specs()
                    .map(|spec| {
                        let description = serde_json::to_value(spec.description())
                            .map_err(|error| ActorError::Internal(error.to_string()))?;
                        Ok((spec.type_name().to_owned(), description))
                    })
                    .collect::<Result<_, ActorError>>()?;
                Reply::from_msg(&ProtocolDescriptionReply { types })
            },

            _ => Err(ActorError::UnrecognizedPacketType),
        }
    }

    fn handle_debuggee_event(
        &self,
        browser_id: u32,
        event: &DebuggeeEvent,
        registry: &ActorRegistry,
    ) {
        if matches!(event, DebuggeeEvent::TabClosed) &&
            self.tabs.borrow_mut().remove(&browser_id).is_some()
        {
            registry.emit_later(&self.name(), "tabListChanged", &serde_json::Map::new());
        }
    }
}

impl RootActor {
    pub(crate) fn new(application_type: String, debuggee: Arc<dyn Debuggee>) -> RootActor {
        RootActor {
            application_type,
            debuggee,
            tabs: RefCell::new(FxHashMap::default()),
        }
    }

    /// The greeting packet sent when a client connects.
    pub(crate) fn encodable(&self) -> RootActorMsg {
        RootActorMsg {
            from: self.name(),
            application_type: self.application_type.clone(),
            traits: ActorTraits {
                sources: false,
                highlightable: false,
                custom_highlighters: false,
                network_monitor: false,
            },
        }
    }

    pub(crate) fn greeting(&self) -> Result<Packet, serde_json::Error> {
        rdp_protocol::packet::to_packet(&self.encodable())
    }

    /// The descriptor for a tab, reusing the one handed out before if it is
    /// still alive.
    fn descriptor_for(&self, tab: TabInfo, registry: &ActorRegistry) -> String {
        let mut tabs = self.tabs.borrow_mut();
        if let Some(name) = tabs.get(&tab.browser_id) {
            if let Some(descriptor) = registry.find::<TabDescriptorActor>(name) {
                descriptor.update_tab(tab);
                return name.clone();
            }
        }

        let browser_id = tab.browser_id;
        let descriptor = TabDescriptorActor::new(
            new_name("tabDescriptor"),
            tab,
            self.debuggee.clone(),
        );
        let name = descriptor.name();
        registry.register_child_later(&self.name(), Box::new(descriptor));
        tabs.insert(browser_id, name.clone());
        name
    }
}
