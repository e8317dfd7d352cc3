/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! <https://searchfox.org/mozilla-central/source/devtools/shared/specs/descriptors/tab.js>

use crate::spec::{EventSpec, MethodSpec, SpecRegistry, SpecValidationError};

pub const TYPE_NAME: &str = "tabDescriptor";

pub fn register(registry: &mut SpecRegistry) -> Result<(), SpecValidationError> {
    registry.generate_actor_spec(
        TYPE_NAME,
        vec![
            MethodSpec::new("getTarget").retval("frame", super::window_global::TYPE_NAME),
            MethodSpec::new("getFavicon").retval("favicon", "nullable:string"),
            MethodSpec::new("getWatcher")
                .option("isServerTargetSwitchingEnabled", 0, "boolean")
                .option("isPopupDebuggingEnabled", 0, "boolean")
                .retval("watcher", super::watcher::TYPE_NAME),
            MethodSpec::new("reloadDescriptor").option("bypassCache", 0, "boolean"),
            MethodSpec::new("navigateTo")
                .arg("url", 0, "string")
                .option("waitForLoad", 1, "boolean"),
            MethodSpec::new("detach").release(),
        ],
        vec![EventSpec::new("descriptor-destroyed")],
    )?;
    Ok(())
}
