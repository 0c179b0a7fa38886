// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::compile::{Category, RuleSet};
use crate::platform::SwitchSink;
use std::collections::BTreeMap;

/// Operations for one category of one tenant.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ops {
    pub add: Vec<String>,
    pub modify: Vec<String>,
    pub delete: Vec<String>,

    /// Rules that were already installed as compiled.
    pub exist: usize,
}

impl Ops {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.modify.is_empty() && self.delete.is_empty()
    }
}

/// What has to change on the switch to go from the installed rules of a
/// tenant to a freshly compiled set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delta {
    ops: BTreeMap<Category, Ops>,
}

impl Delta {
    pub fn ops(&self, category: Category) -> Option<&Ops> {
        self.ops.get(&category)
    }

    /// True when nothing needs to be sent to the switch.
    pub fn is_empty(&self) -> bool {
        self.ops.values().all(Ops::is_empty)
    }

    pub fn count(&self) -> usize {
        self.ops
            .values()
            .map(|o| o.add.len() + o.modify.len() + o.delete.len())
            .sum()
    }

    /// Push the changes to the switch, groups first.
    pub fn flush<S: SwitchSink + ?Sized>(&self, sink: &S) {
        for category in Category::FLUSH_ORDER {
            let Some(ops) = self.ops.get(&category) else {
                continue;
            };
            if ops.is_empty() {
                continue;
            }
            sink.install(category, &ops.add, &ops.modify, &ops.delete);
        }
    }
}

/// Rules believed to be installed, per tenant. The belief is optimistic:
/// a failed switch command is not rolled back here.
#[derive(Debug, Default)]
pub struct FlowTable {
    installed: BTreeMap<String, RuleSet>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the installed rules of `tenant` with `compiled` and return
    /// the operations that get the switch there.
    pub fn reconcile(&mut self, tenant: &str, compiled: RuleSet) -> Delta {
        let old = self.installed.remove(tenant).unwrap_or_default();
        let empty = BTreeMap::new();
        let mut delta = Delta::default();

        for category in Category::ALL {
            let before = old.category(category).unwrap_or(&empty);
            let after = compiled.category(category).unwrap_or(&empty);
            let mut ops = Ops::default();

            for (key, text) in after {
                match before.get(key) {
                    None => ops.add.push(text.clone()),
                    Some(t) if t != text => ops.modify.push(text.clone()),
                    Some(_) => ops.exist += 1,
                }
            }
            ops.delete.extend(
                before
                    .iter()
                    .filter(|(key, _)| !after.contains_key(*key))
                    .map(|(_, text)| text.clone()),
            );

            if !ops.is_empty() || ops.exist > 0 {
                delta.ops.insert(category, ops);
            }
        }

        if !compiled.is_empty() {
            self.installed.insert(tenant.to_string(), compiled);
        }
        delta
    }

    pub fn installed(&self, tenant: &str) -> Option<&RuleSet> {
        self.installed.get(tenant)
    }

    pub fn tenants(&self) -> impl Iterator<Item = &String> {
        self.installed.keys()
    }
}
