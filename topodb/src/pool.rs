// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Serialize;
use std::collections::BTreeSet;

/// Allocator for small integer correlation markers (broadcast ids, router
/// ids). Released ids are recycled lowest first before the counter
/// advances, so the set of ids in use stays dense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdPool {
    next: u32,
    free: BTreeSet<u32>,
    used: BTreeSet<u32>,
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdPool {
    pub fn new(first: u32) -> Self {
        Self {
            next: first,
            free: BTreeSet::new(),
            used: BTreeSet::new(),
        }
    }

    pub fn alloc(&mut self) -> u32 {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                let id = self.next;
                self.next += 1;
                id
            }
        };
        self.used.insert(id);
        id
    }

    /// Return an id to the pool. Releasing an id that is not in use is a
    /// no-op and returns false.
    pub fn release(&mut self, id: u32) -> bool {
        if !self.used.remove(&id) {
            return false;
        }
        self.free.insert(id);
        true
    }

    pub fn used(&self) -> &BTreeSet<u32> {
        &self.used
    }

    pub fn free(&self) -> &BTreeSet<u32> {
        &self.free
    }
}
