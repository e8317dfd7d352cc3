/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The seam between the protocol actors and whatever is being debugged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A top-level browsing context the debuggee exposes as a tab.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TabInfo {
    pub browser_id: u32,
    pub browsing_context_id: u64,
    pub outer_window_id: u64,
    pub url: String,
    pub title: String,
    pub selected: bool,
}

/// The document a tab shows once the debugger is attached to it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TargetInfo {
    pub browsing_context_id: u64,
    pub outer_window_id: u64,
    pub url: String,
    pub title: String,
}

/// A refusal from the debuggee. `code` is sent to the client as the error
/// code, so it should be a protocol code such as `wrongState` or a
/// debuggee-specific one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebuggeeError {
    pub code: String,
    pub message: String,
}

impl DebuggeeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        DebuggeeError {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DebuggeeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DebuggeeError {}

/// Something that happened to a tab, reported by the embedder.
#[derive(Clone, Debug, PartialEq)]
pub enum DebuggeeEvent {
    NavigationStart {
        url: String,
    },
    NavigationStop {
        url: String,
        title: String,
        /// The new document lives in a different process, so its target
        /// replaces the old one.
        process_swap: bool,
    },
    TitleChanged {
        title: String,
    },
    ProcessCrashed,
    TabClosed,
}

/// Target introspection, implemented by the embedder. Calls come from
/// connection threads; `favicon` may also be called from a helper thread and
/// is allowed to block.
pub trait Debuggee: Send + Sync {
    fn tabs(&self) -> Vec<TabInfo>;

    fn attach(&self, browser_id: u32) -> Result<TargetInfo, DebuggeeError>;

    fn detach(&self, browser_id: u32);

    fn navigate(&self, browser_id: u32, url: &str) -> Result<(), DebuggeeError>;

    fn reload(&self, browser_id: u32, bypass_cache: bool) -> Result<(), DebuggeeError>;

    fn favicon(&self, browser_id: u32) -> Option<String>;

    fn parent_browsing_context(&self, browsing_context_id: u64) -> Option<u64>;
}
