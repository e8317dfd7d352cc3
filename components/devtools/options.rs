/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Configuration of the debugging server.

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest packet accepted unless configured otherwise.
pub const DEFAULT_MAX_PACKET_LENGTH: u64 = 256 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// Address the listener binds to.
    pub bind_address: String,

    /// Port to listen on. `0` picks a free port.
    pub port: u16,

    /// Packets announcing a larger length are refused and the connection is
    /// dropped.
    pub max_packet_length: u64,

    /// Reported to clients in the greeting packet.
    pub application_type: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            bind_address: "127.0.0.1".to_owned(),
            port: 6080,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            application_type: "browser".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OptionsError {
    pub variable: &'static str,
    pub value: String,
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value {:?} for {}", self.value, self.variable)
    }
}

impl std::error::Error for OptionsError {}

impl ServerOptions {
    /// The defaults, overridden by `RDP_BIND_ADDRESS`, `RDP_PORT`,
    /// `RDP_MAX_PACKET_LENGTH` and `RDP_APPLICATION_TYPE` where set.
    pub fn from_env() -> Result<ServerOptions, OptionsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerOptions, OptionsError> {
        let mut options = ServerOptions::default();
        if let Some(address) = lookup("RDP_BIND_ADDRESS") {
            options.bind_address = address;
        }
        if let Some(port) = lookup("RDP_PORT") {
            options.port = port.parse().map_err(|_| OptionsError {
                variable: "RDP_PORT",
                value: port,
            })?;
        }
        if let Some(length) = lookup("RDP_MAX_PACKET_LENGTH") {
            options.max_packet_length = length.parse().map_err(|_| OptionsError {
                variable: "RDP_MAX_PACKET_LENGTH",
                value: length,
            })?;
        }
        if let Some(application_type) = lookup("RDP_APPLICATION_TYPE") {
            options.application_type = application_type;
        }
        Ok(options)
    }
}
