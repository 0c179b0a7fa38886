// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turn port events into the set of tenants that need a recompute.

use crate::log::sched_log;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use topodb::{Db, PortEvent, PortEventKind};

pub struct Scheduler {
    /// Ports announced before the store knew them, with the number of
    /// lookups tried so far.
    waiting: BTreeMap<String, u32>,

    /// Tenant of every port seen added, so a removal can still be placed
    /// after the port itself is gone from the store.
    owners: BTreeMap<String, String>,

    max_retries: u32,
    log: Logger,
}

impl Scheduler {
    pub fn new(max_retries: u32, log: Logger) -> Self {
        Self {
            waiting: BTreeMap::new(),
            owners: BTreeMap::new(),
            max_retries,
            log,
        }
    }

    /// Resolve a batch of events, then retry everything still waiting.
    /// Returns the tenants touched.
    pub fn collect<I>(&mut self, events: I, db: &Db) -> BTreeSet<String>
    where
        I: IntoIterator<Item = PortEvent>,
    {
        let mut tenants = BTreeSet::new();
        for e in events {
            match e.kind {
                PortEventKind::Add => self.added(&e.port_id, db, &mut tenants),
                PortEventKind::Del => self.removed(&e.port_id, db, &mut tenants),
            }
        }
        self.retry(db, &mut tenants);
        tenants
    }

    fn added(&mut self, id: &str, db: &Db, tenants: &mut BTreeSet<String>) {
        match db.port(id) {
            Some(p) => {
                self.waiting.remove(id);
                if p.device_owner.is_infrastructure() {
                    return;
                }
                self.owners.insert(id.to_string(), p.tenant_id.clone());
                tenants.insert(p.tenant_id);
            }
            None => {
                sched_log!(self, debug, "port {} not in store yet", id);
                *self.waiting.entry(id.to_string()).or_default() += 1;
            }
        }
    }

    fn removed(&mut self, id: &str, db: &Db, tenants: &mut BTreeSet<String>) {
        self.waiting.remove(id);
        let owner = self.owners.remove(id);
        match db.port(id) {
            Some(p) if p.device_owner.is_infrastructure() => {}
            Some(p) => {
                tenants.insert(p.tenant_id);
            }
            None => {
                if let Some(t) = owner {
                    tenants.insert(t);
                }
            }
        }
    }

    fn retry(&mut self, db: &Db, tenants: &mut BTreeSet<String>) {
        let waiting: Vec<(String, u32)> = std::mem::take(&mut self.waiting)
            .into_iter()
            .collect();
        for (id, tries) in waiting {
            if tries > self.max_retries {
                sched_log!(self, info,
                    "giving up on port {} after {} lookups", id, tries
                );
                continue;
            }
            match db.port(&id) {
                Some(p) if p.device_owner.is_infrastructure() => {}
                Some(p) => {
                    self.owners.insert(id, p.tenant_id.clone());
                    tenants.insert(p.tenant_id);
                }
                None => {
                    self.waiting.insert(id, tries + 1);
                }
            }
        }

        // ports the store dropped without a removal event reaching us
        let waiting = &self.waiting;
        self.owners
            .retain(|id, _| waiting.contains_key(id) || db.port(id).is_some());
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use topodb::{Network, Port, Record, Subnet};

    fn db() -> Db {
        let db = Db::new("host-a", ova_common::log::test_logger());
        db.add(Record::Network(Network {
            id: "n1".into(),
            tenant_id: "t1".into(),
            ..Default::default()
        }))
        .unwrap();
        db.add(Record::Subnet(Subnet {
            id: "s1".into(),
            tenant_id: "t1".into(),
            network_id: "n1".into(),
            ..Default::default()
        }))
        .unwrap();
        db
    }

    fn port(db: &Db, id: &str, owner: &str) {
        db.add(Record::Port(Port {
            id: id.into(),
            tenant_id: "t1".into(),
            network_id: "n1".into(),
            subnet_id: Some("s1".into()),
            device_owner: owner.to_string().into(),
            host_name: "host-a".into(),
            ..Default::default()
        }))
        .unwrap();
    }

    fn set(v: &[&str]) -> BTreeSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn known_ports_resolve_to_tenants() {
        let db = db();
        port(&db, "p1", "compute:nova");
        port(&db, "gw", "network:router_gateway");
        let mut s = Scheduler::new(10, ova_common::log::test_logger());

        let t = s.collect(
            [PortEvent::add("p1"), PortEvent::add("gw")],
            &db,
        );
        assert_eq!(t, set(&["t1"]));
        assert!(s.collect(None, &db).is_empty(), "nothing pending");
    }

    #[test]
    fn late_ports_wait_then_expire() {
        let db = db();
        let mut s = Scheduler::new(2, ova_common::log::test_logger());

        assert!(s.collect([PortEvent::add("p1")], &db).is_empty());
        assert_eq!(s.waiting(), 1);

        port(&db, "p1", "compute:nova");
        assert_eq!(s.collect(None, &db), set(&["t1"]));
        assert_eq!(s.waiting(), 0);

        assert!(s.collect([PortEvent::add("p2")], &db).is_empty());
        for _ in 0..3 {
            s.collect(None, &db);
        }
        assert_eq!(s.waiting(), 0, "retry bound reached");
    }

    #[test]
    fn removal_of_forgotten_port_uses_last_owner() {
        let db = db();
        port(&db, "p1", "compute:nova");
        let mut s = Scheduler::new(10, ova_common::log::test_logger());
        s.collect([PortEvent::add("p1")], &db);

        db.delete(topodb::Table::Port, "p1");
        assert_eq!(s.collect([PortEvent::del("p1")], &db), set(&["t1"]));

        // unknown and never seen
        assert!(s.collect([PortEvent::del("p9")], &db).is_empty());
    }

    #[test]
    fn owners_of_silently_removed_ports_are_pruned() {
        let db = db();
        port(&db, "p1", "compute:nova");
        port(&db, "p2", "compute:nova");
        let mut s = Scheduler::new(10, ova_common::log::test_logger());
        s.collect([PortEvent::add("p1"), PortEvent::add("p2")], &db);
        assert_eq!(s.owners.len(), 2);

        db.delete(topodb::Table::Port, "p1");
        s.collect(None, &db);
        assert_eq!(s.owners.keys().collect::<Vec<_>>(), vec!["p2"]);

        // a late removal for it no longer names a tenant
        assert!(s.collect([PortEvent::del("p1")], &db).is_empty());
    }
}
