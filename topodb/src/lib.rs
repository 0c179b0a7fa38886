// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local replica of the cluster network topology.

pub mod db;
pub mod error;
pub mod log;
pub mod pool;
pub mod types;

pub use db::{Apply, Db, TopologyData};
pub use error::Error;
pub use pool::IdPool;
pub use types::*;

pub const COMPONENT_TOPODB: &str = "topodb";
pub const MOD_DB: &str = "database";

/// Capacity of the port event queue shared by the store and the local port
/// monitor.
pub const EVENT_QUEUE_DEPTH: usize = 1024;
