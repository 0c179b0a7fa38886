// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutual exclusion between topology mutation and topology recomputation.
//!
//! The sync loop is the only writer of the topology store and the
//! recompute loop is its only bulk reader. Neither side ever blocks on the
//! other: a side that finds the gate held by its peer skips its turn and
//! tries again after a short pause.

use crate::lock;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct GateState {
    sync_busy: bool,
    topo_busy: bool,
}

#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<Mutex<GateState>>,
}

/// Held by the recompute loop for the duration of one recompute cycle.
pub struct TopoGuard {
    state: Arc<Mutex<GateState>>,
}

impl Drop for TopoGuard {
    fn drop(&mut self) {
        lock!(self.state).topo_busy = false;
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the sync loop busy. Returns false, leaving the gate untouched,
    /// if a recompute cycle currently holds it.
    pub fn sync_enter(&self) -> bool {
        let mut s = lock!(self.state);
        if s.topo_busy {
            return false;
        }
        s.sync_busy = true;
        true
    }

    /// The sync loop has drained its inbound traffic.
    pub fn sync_idle(&self) {
        lock!(self.state).sync_busy = false;
    }

    pub fn sync_busy(&self) -> bool {
        lock!(self.state).sync_busy
    }

    /// Begin a recompute cycle. Returns `None` while the sync loop is
    /// busy.
    pub fn topo_enter(&self) -> Option<TopoGuard> {
        let mut s = lock!(self.state);
        if s.sync_busy || s.topo_busy {
            return None;
        }
        s.topo_busy = true;
        Some(TopoGuard {
            state: self.state.clone(),
        })
    }

    pub fn topo_busy(&self) -> bool {
        lock!(self.state).topo_busy
    }
}
