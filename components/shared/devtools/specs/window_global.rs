/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! <https://searchfox.org/mozilla-central/source/devtools/shared/specs/targets/window-global.js>

use crate::spec::{EventSpec, MethodSpec, SpecRegistry, SpecValidationError};

pub const TYPE_NAME: &str = "windowGlobalTarget";

pub fn register(registry: &mut SpecRegistry) -> Result<(), SpecValidationError> {
    registry.generate_actor_spec(
        TYPE_NAME,
        vec![
            MethodSpec::new("reload").option("bypassCache", 0, "boolean"),
            MethodSpec::new("detach").release(),
        ],
        vec![
            EventSpec::new("tabNavigated")
                .field("url", "string")
                .field("title", "string")
                .field("state", "string"),
        ],
    )?;
    Ok(())
}
