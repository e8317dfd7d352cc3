/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Client side of the remote debugging protocol. A [`Client`] reads the
//! server's greeting, then hands out [`Front`]s for the actors the server
//! tells it about.

#![crate_name = "rdp_client"]
#![crate_type = "rlib"]
#![deny(unsafe_code)]

pub use crate::client::{Client, ConnectError};
pub use crate::front::Front;
pub use crate::reply::{Payload, PendingReply};

mod client;
mod front;
mod reply;
