/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Descriptor actor that represents a web view. It can link a tab to the
//! corresponding watcher and target actors, and drives the tab through
//! attach, navigation and detach.
//!
//! <https://searchfox.org/mozilla-central/source/devtools/server/actors/descriptors/tab.js>

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use rdp_protocol::{ActorSpec, builtin_spec};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::actor::{
    Actor, ActorError, ActorRegistry, ClientRequest, DeferredReply, Reply, new_name,
};
use crate::actors::watcher::WatcherActor;
use crate::actors::window_global::WindowGlobalTargetActor;
use crate::debuggee::{Debuggee, DebuggeeEvent, TabInfo};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DescriptorState {
    /// No target has been asked for yet, or the last one went away.
    Unattached,
    Attached,
    /// A navigation started and has not stopped yet.
    Navigating,
    /// Terminal. The actor is about to be destroyed.
    Detached,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorTraits {
    watcher: bool,
    supports_reload_descriptor: bool,
    supports_navigation: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TabDescriptorActorMsg {
    actor: String,
    browser_id: u32,
    #[serde(rename = "browsingContextID")]
    browsing_context_id: u64,
    is_zombie_tab: bool,
    #[serde(rename = "outerWindowID")]
    outer_window_id: u64,
    selected: bool,
    title: String,
    traits: DescriptorTraits,
    url: String,
}

#[derive(Serialize)]
struct GetTargetReply {
    frame: String,
}

#[derive(Serialize)]
struct GetFaviconReply {
    favicon: Option<String>,
}

#[derive(Serialize)]
struct GetWatcherReply {
    watcher: String,
}

pub(crate) struct TabDescriptorActor {
    name: String,
    debuggee: Arc<dyn Debuggee>,
    tab: RefCell<TabInfo>,
    state: Cell<DescriptorState>,
    target: RefCell<Option<String>>,
    watcher: RefCell<Option<String>>,
    /// A `navigateTo` waiting for the load to finish.
    pending_navigation: RefCell<Option<DeferredReply>>,
}

impl Actor for TabDescriptorActor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn spec(&self) -> &'static ActorSpec {
        builtin_spec(rdp_protocol::specs::tab_descriptor::TYPE_NAME)
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
            "getTarget" => {
                let frame = self.ensure_target(registry)?;
                Reply::from_msg(&GetTargetReply { frame })
            },

            "getFavicon" => {
                let browser_id = self.browser_id();
                let debuggee = self.debuggee.clone();
                let (reply, deferred) = request.defer();
                thread::Builder::new()
                    .name("RdpFavicon".to_owned())
                    .spawn(move || {
                        let favicon = debuggee.favicon(browser_id);
                        deferred.resolve_msg(&GetFaviconReply { favicon });
                    })
                    .map_err(|error| ActorError::Internal(error.to_string()))?;
                Ok(reply)
            },

            "getWatcher" => {
                let watcher = self.ensure_watcher(registry);
                Reply::from_msg(&GetWatcherReply { watcher })
            },

            "reloadDescriptor" => {
                let bypass_cache = request.option(0, "bypassCache")?.unwrap_or(false);
                self.debuggee.reload(self.browser_id(), bypass_cache)?;
                Ok(Reply::empty())
            },

            "navigateTo" => {
                let url: String = request.arg(0)?;
                let wait_for_load = request.option(1, "waitForLoad")?.unwrap_or(false);
                self.debuggee.navigate(self.browser_id(), &url)?;
                if self.state.get() == DescriptorState::Attached {
                    self.state.set(DescriptorState::Navigating);
                }
                if !wait_for_load {
                    return Ok(Reply::empty());
                }
                let (reply, deferred) = request.defer();
                *self.pending_navigation.borrow_mut() = Some(deferred);
                Ok(reply)
            },

            "detach" => {
                if matches!(
                    self.state.get(),
                    DescriptorState::Attached | DescriptorState::Navigating
                ) {
                    self.debuggee.detach(self.browser_id());
                }
                self.state.set(DescriptorState::Detached);
                Ok(Reply::empty())
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
        if browser_id != self.browser_id() || self.state.get() == DescriptorState::Detached {
            return;
        }
        match event {
            DebuggeeEvent::NavigationStart { url } => {
                if self.state.get() == DescriptorState::Attached {
                    self.state.set(DescriptorState::Navigating);
                }
                if let Some(target) = self.live_target(registry) {
                    target.navigation_start(url, registry);
                }
                if let Some(watcher) = self.live_watcher(registry) {
                    watcher.document_event("will-navigate", url, None, registry);
                }
            },
            DebuggeeEvent::NavigationStop {
                url,
                title,
                process_swap,
            } => {
                {
                    let mut tab = self.tab.borrow_mut();
                    tab.url = url.clone();
                    tab.title = title.clone();
                }
                if *process_swap {
                    self.replace_target(registry);
                } else if let Some(target) = self.live_target(registry) {
                    target.navigation_stop(url, title, registry);
                }
                if let Some(watcher) = self.live_watcher(registry) {
                    watcher.document_event("dom-complete", url, Some(title.as_str()), registry);
                }
                if self.state.get() == DescriptorState::Navigating {
                    self.state.set(DescriptorState::Attached);
                }
                if let Some(deferred) = self.pending_navigation.borrow_mut().take() {
                    deferred.resolve(Ok(Map::new()));
                }
            },
            DebuggeeEvent::TitleChanged { title } => {
                self.tab.borrow_mut().title = title.clone();
                if let Some(target) = self.live_target(registry) {
                    target.set_title(title);
                }
            },
            DebuggeeEvent::ProcessCrashed => {
                warn!("Content process of browser {} crashed", browser_id);
                self.drop_target(registry);
                self.state.set(DescriptorState::Unattached);
                if let Some(deferred) = self.pending_navigation.borrow_mut().take() {
                    deferred.resolve(Err(ActorError::WrongState(
                        "The tab crashed while navigating".to_owned(),
                    )));
                }
            },
            DebuggeeEvent::TabClosed => {
                registry.emit_later(&self.name, "descriptor-destroyed", &Map::new());
                registry.destroy_later(&self.name);
            },
        }
    }

    fn cleanup(&self) {
        if matches!(
            self.state.get(),
            DescriptorState::Attached | DescriptorState::Navigating
        ) {
            self.debuggee.detach(self.browser_id());
        }
        self.state.set(DescriptorState::Detached);
        if let Some(deferred) = self.pending_navigation.borrow_mut().take() {
            deferred.resolve(Err(ActorError::WrongState("The tab went away".to_owned())));
        }
    }
}

impl TabDescriptorActor {
    pub(crate) fn new(name: String, tab: TabInfo, debuggee: Arc<dyn Debuggee>) -> Self {
        TabDescriptorActor {
            name,
            debuggee,
            tab: RefCell::new(tab),
            state: Cell::new(DescriptorState::Unattached),
            target: RefCell::new(None),
            watcher: RefCell::new(None),
            pending_navigation: RefCell::new(None),
        }
    }

    pub(crate) fn encodable(&self) -> TabDescriptorActorMsg {
        let tab = self.tab.borrow();
        TabDescriptorActorMsg {
            actor: self.name(),
            browser_id: tab.browser_id,
            browsing_context_id: tab.browsing_context_id,
            is_zombie_tab: false,
            outer_window_id: tab.outer_window_id,
            selected: tab.selected,
            title: tab.title.clone(),
            traits: DescriptorTraits {
                watcher: true,
                supports_reload_descriptor: true,
                supports_navigation: true,
            },
            url: tab.url.clone(),
        }
    }

    pub(crate) fn browser_id(&self) -> u32 {
        self.tab.borrow().browser_id
    }

    pub(crate) fn update_tab(&self, tab: TabInfo) {
        *self.tab.borrow_mut() = tab;
    }

    /// The target of this tab, attaching to the debuggee if there is none.
    /// A failed attach leaves the descriptor unattached so the client can
    /// retry.
    pub(crate) fn ensure_target(&self, registry: &ActorRegistry) -> Result<String, ActorError> {
        if let Some(name) = self.target.borrow().as_ref() {
            if registry.contains(name) {
                return Ok(name.clone());
            }
        }
        let info = self.debuggee.attach(self.browser_id())?;
        let target = WindowGlobalTargetActor::new(
            new_name("windowGlobalTarget"),
            self.browser_id(),
            info,
            self.debuggee.clone(),
        );
        let name = target.name();
        registry.register_child_later(&self.name, Box::new(target));
        *self.target.borrow_mut() = Some(name.clone());
        if self.state.get() == DescriptorState::Unattached {
            self.state.set(DescriptorState::Attached);
        }
        debug!("{} attached to browser {}", self.name, self.browser_id());
        Ok(name)
    }

    fn ensure_watcher(&self, registry: &ActorRegistry) -> String {
        if let Some(name) = self.watcher.borrow().as_ref() {
            if registry.contains(name) {
                return name.clone();
            }
        }
        let watcher = WatcherActor::new(new_name("watcher"), self.name(), self.debuggee.clone());
        let name = watcher.name();
        registry.register_child_later(&self.name, Box::new(watcher));
        *self.watcher.borrow_mut() = Some(name.clone());
        name
    }

    fn live_target<'a>(&self, registry: &'a ActorRegistry) -> Option<&'a WindowGlobalTargetActor> {
        let name = self.target.borrow().clone()?;
        registry.find::<WindowGlobalTargetActor>(&name)
    }

    fn live_watcher<'a>(&self, registry: &'a ActorRegistry) -> Option<&'a WatcherActor> {
        let name = self.watcher.borrow().clone()?;
        registry.find::<WatcherActor>(&name)
    }

    /// Destroy the current target, telling the watcher about it.
    fn drop_target(&self, registry: &ActorRegistry) {
        let Some(target) = self.live_target(registry) else {
            return;
        };
        if let Some(watcher) = self.live_watcher(registry) {
            watcher.target_destroyed(target.form(), registry);
        }
        registry.destroy_later(&target.name());
        *self.target.borrow_mut() = None;
    }

    /// A navigation moved the document to another process: the old target
    /// goes away and a new one takes its place.
    fn replace_target(&self, registry: &ActorRegistry) {
        if self.live_target(registry).is_none() {
            return;
        }
        self.drop_target(registry);
        match self.ensure_target(registry) {
            Ok(target) => {
                if let Some(watcher) = self.live_watcher(registry) {
                    watcher.target_available(&target, registry);
                }
            },
            Err(error) => {
                warn!("Could not attach to browser {} after a process swap: {}", self.browser_id(), error);
                self.state.set(DescriptorState::Unattached);
            },
        }
    }
}
