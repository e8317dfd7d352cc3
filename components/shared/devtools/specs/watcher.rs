/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! <https://searchfox.org/mozilla-central/source/devtools/shared/specs/watcher.js>

use crate::spec::{EventSpec, MethodSpec, SpecRegistry, SpecValidationError};

pub const TYPE_NAME: &str = "watcher";

pub fn register(registry: &mut SpecRegistry) -> Result<(), SpecValidationError> {
    registry.generate_actor_spec(
        TYPE_NAME,
        vec![
            MethodSpec::new("watchTargets").arg("targetType", 0, "string"),
            MethodSpec::new("unwatchTargets")
                .arg("targetType", 0, "string")
                .oneway(),
            MethodSpec::new("watchResources").arg("resourceTypes", 0, "array:string"),
            MethodSpec::new("unwatchResources")
                .arg("resourceTypes", 0, "array:string")
                .oneway(),
            MethodSpec::new("getParentBrowsingContextID")
                .arg("browsingContextID", 0, "number")
                .retval("browsingContextID", "nullable:number"),
        ],
        vec![
            EventSpec::new("target-available-form").field("target", super::window_global::TYPE_NAME),
            EventSpec::new("target-destroyed-form").field("target", "json"),
            EventSpec::new("resources-available-array").field("array", "json"),
        ],
    )?;
    Ok(())
}
