/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Target actor for the document shown in a tab. It is replaced by a new one
//! when a navigation moves the tab to another content process.
//!
//! <https://searchfox.org/mozilla-central/source/devtools/server/actors/targets/window-global.js>

use std::cell::RefCell;
use std::sync::Arc;

use rdp_protocol::{ActorSpec, builtin_spec};
use serde::Serialize;
use serde_json::Value;

use crate::actor::{Actor, ActorError, ActorRegistry, ClientRequest, Reply};
use crate::debuggee::{Debuggee, TargetInfo};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WindowGlobalTargetTraits {
    is_browsing_context: bool,
    navigation: bool,
    supports_top_level_target_flag: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WindowGlobalTargetActorMsg {
    actor: String,
    #[serde(rename = "browsingContextID")]
    browsing_context_id: u64,
    #[serde(rename = "outerWindowID")]
    outer_window_id: u64,
    is_top_level_target: bool,
    title: String,
    url: String,
    traits: WindowGlobalTargetTraits,
}

#[derive(Serialize)]
struct TabNavigatedMsg<'a> {
    url: &'a str,
    title: &'a str,
    state: &'static str,
}

pub(crate) struct WindowGlobalTargetActor {
    name: String,
    browser_id: u32,
    debuggee: Arc<dyn Debuggee>,
    info: RefCell<TargetInfo>,
}

impl Actor for WindowGlobalTargetActor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn spec(&self) -> &'static ActorSpec {
        builtin_spec(rdp_protocol::specs::window_global::TYPE_NAME)
    }

    fn form(&self) -> Value {
        serde_json::to_value(self.encodable()).unwrap_or_default()
    }

    fn handle_request(
        &self,
        request: ClientRequest,
        _registry: &ActorRegistry,
    ) -> Result<Reply, ActorError> {
        match request.method_name() {
            "reload" => {
                let bypass_cache = request.option(0, "bypassCache")?.unwrap_or(false);
                self.debuggee.reload(self.browser_id, bypass_cache)?;
                Ok(Reply::empty())
            },

            // Releasing: the connection destroys us once the reply is out.
            "detach" => Ok(Reply::empty()),

            _ => Err(ActorError::UnrecognizedPacketType),
        }
    }
}

impl WindowGlobalTargetActor {
    pub(crate) fn new(
        name: String,
        browser_id: u32,
        info: TargetInfo,
        debuggee: Arc<dyn Debuggee>,
    ) -> Self {
        WindowGlobalTargetActor {
            name,
            browser_id,
            debuggee,
            info: RefCell::new(info),
        }
    }

    pub(crate) fn encodable(&self) -> WindowGlobalTargetActorMsg {
        let info = self.info.borrow();
        WindowGlobalTargetActorMsg {
            actor: self.name(),
            browsing_context_id: info.browsing_context_id,
            outer_window_id: info.outer_window_id,
            is_top_level_target: true,
            title: info.title.clone(),
            url: info.url.clone(),
            traits: WindowGlobalTargetTraits {
                is_browsing_context: true,
                navigation: true,
                supports_top_level_target_flag: true,
            },
        }
    }

    pub(crate) fn set_title(&self, title: &str) {
        self.info.borrow_mut().title = title.to_owned();
    }

    pub(crate) fn navigation_start(&self, url: &str, registry: &ActorRegistry) {
        let title = self.info.borrow().title.clone();
        registry.emit_later(
            &self.name,
            "tabNavigated",
            &TabNavigatedMsg {
                url,
                title: &title,
                state: "start",
            },
        );
    }

    pub(crate) fn navigation_stop(&self, url: &str, title: &str, registry: &ActorRegistry) {
        {
            let mut info = self.info.borrow_mut();
            info.url = url.to_owned();
            info.title = title.to_owned();
        }
        registry.emit_later(
            &self.name,
            "tabNavigated",
            &TabNavigatedMsg {
                url,
                title,
                state: "stop",
            },
        );
    }
}
