/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! <https://searchfox.org/mozilla-central/source/devtools/shared/specs/root.js>

use crate::spec::{EventSpec, MethodSpec, SpecRegistry, SpecValidationError};

pub const TYPE_NAME: &str = "root";

pub fn register(registry: &mut SpecRegistry) -> Result<(), SpecValidationError> {
    registry.generate_actor_spec(
        TYPE_NAME,
        vec![
            MethodSpec::new("listTabs").retval("tabs", "array:tabDescriptor"),
            MethodSpec::new("getTab")
                .option("browserId", 0, "number")
                .retval("tab", super::tab_descriptor::TYPE_NAME),
            MethodSpec::new("protocolDescription").retval("types", "json"),
        ],
        vec![EventSpec::new("tabListChanged")],
    )?;
    Ok(())
}
