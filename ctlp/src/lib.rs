// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller protocol: wire codec, controller session and topology sync.

pub mod clock;
pub mod connection;
pub mod error;
mod log;
pub mod messages;
pub mod sync;

pub use connection::{Session, SessionConfig};
pub use error::Error;
pub use messages::{Color, Header, Message, MessageType};
pub use sync::{Inbound, SyncConfig, SyncEngine};

pub const COMPONENT_CTLP: &str = "ctlp";
pub const MOD_SESSION: &str = "session";
pub const MOD_SYNC: &str = "sync";

/// Outbound frames waiting for the session to write them.
pub const SEND_QUEUE_DEPTH: usize = 128;

/// Inbound messages waiting for the sync loop.
pub const RECV_QUEUE_DEPTH: usize = 1024;

/// Out-of-order messages waiting for their parent records.
pub const DEFERRED_QUEUE_DEPTH: usize = 128;

#[cfg(test)]
mod test;
