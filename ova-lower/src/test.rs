// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recompute cycles against a recording switch.

use crate::compile::{miss_rules, Category};
use crate::platform::test::{RecordingSink, StaticResolver, Verb};
use crate::{Lower, LowerConfig};
use ova_common::gate::Gate;
use pretty_assertions::assert_eq;
use topodb::{
    vlan_key, Db, HostLink, Network, Port, PortEvent, Record, Subnet, Table,
    Vlan,
};

const HOST: &str = "host-a";

struct Fixture {
    db: Db,
    gate: Gate,
    sink: RecordingSink,
    resolver: StaticResolver,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            db: Db::new(HOST, ova_common::log::test_logger()),
            gate: Gate::new(),
            sink: RecordingSink::default(),
            resolver: StaticResolver::default(),
        }
    }

    fn lower(&self) -> Lower<&RecordingSink, &StaticResolver> {
        Lower::new(
            self.db.clone(),
            self.gate.clone(),
            &self.sink,
            &self.resolver,
            LowerConfig {
                uplink: 1,
                ..Default::default()
            },
            ova_common::log::test_logger(),
        )
    }

    fn topology(&self) {
        self.db
            .add(Record::HostLink(HostLink {
                host: HOST.into(),
                tor_id: "tor1".into(),
                md5sum: String::new(),
            }))
            .unwrap();
        self.db
            .add(Record::Vlan(Vlan {
                key: vlan_key("tor1", "t1"),
                segmentation_id: Some(100),
                md5sum: String::new(),
            }))
            .unwrap();
        self.db
            .add(Record::Network(Network {
                id: "n1".into(),
                tenant_id: "t1".into(),
                network_type: "vlan".into(),
                ..Default::default()
            }))
            .unwrap();
        self.db
            .add(Record::Subnet(Subnet {
                id: "s1".into(),
                tenant_id: "t1".into(),
                network_id: "n1".into(),
                ip_version: 4,
                ..Default::default()
            }))
            .unwrap();
    }

    fn vm(&self, id: &str, host: &str, n: u8) {
        self.db
            .add(Record::Port(Port {
                id: id.into(),
                tenant_id: "t1".into(),
                network_id: "n1".into(),
                subnet_id: Some("s1".into()),
                device_owner: "compute:nova".to_string().into(),
                ip: format!("10.0.0.{n}"),
                mac: format!("fa:16:3e:00:00:{n:02x}"),
                host_name: host.into(),
                admin_state_up: true,
                ..Default::default()
            }))
            .unwrap();
    }
}

fn verbs(ops: &[crate::platform::test::Op], category: Category) -> Vec<Verb> {
    ops.iter()
        .filter(|o| o.category == category)
        .map(|o| o.verb)
        .collect()
}

#[test]
fn init_clears_groups_and_installs_miss_rules() {
    let f = Fixture::new();
    f.lower().init();
    let ops = f.sink.take();
    assert_eq!(ops[0].verb, Verb::ClearGroups);
    let installed: Vec<String> =
        ops[1..].iter().map(|o| o.text.clone()).collect();
    assert_eq!(installed, miss_rules());
}

#[test]
fn recompute_is_idempotent() {
    let f = Fixture::new();
    let mut lower = f.lower();
    f.topology();
    f.vm("p1", HOST, 10);
    f.vm("p2", "host-b", 11);
    f.resolver.bind("p1", 5);
    lower.notifier().notify_port_event(PortEvent::add("p1"));

    assert!(lower.cycle());
    let ops = f.sink.take();
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|o| o.verb == Verb::Add));
    // a remote peer means a flood group, and groups go first
    assert_eq!(ops[0].category, Category::Group);
    assert!(ops[0].text.contains("bucket=output:1"));
    assert_eq!(f.db.port("p1").and_then(|p| p.handle), Some(5));

    assert!(!lower.cycle(), "nothing changed");
    lower.recompute("t1");
    assert!(f.sink.take().is_empty());
}

#[test]
fn second_local_port_adds_flood_group() {
    let f = Fixture::new();
    let mut lower = f.lower();
    f.topology();
    f.vm("p1", HOST, 10);
    f.resolver.bind("p1", 5);
    lower.notifier().notify_port_event(PortEvent::add("p1"));
    lower.cycle();
    assert!(verbs(&f.sink.take(), Category::Group).is_empty());

    f.vm("p3", HOST, 12);
    f.resolver.bind("p3", 6);
    lower.notifier().notify_port_event(PortEvent::add("p3"));
    assert!(lower.cycle());
    let ops = f.sink.take();
    assert_eq!(verbs(&ops, Category::Group), vec![Verb::Add]);
    assert!(ops[0].text.ends_with("bucket=strip_vlan,output:5,bucket=strip_vlan,output:6"));
}

#[test]
fn unbound_port_compiles_nothing_until_bound() {
    let f = Fixture::new();
    let mut lower = f.lower();
    f.topology();
    f.vm("p1", HOST, 10);
    lower.notifier().notify_port_event(PortEvent::add("p1"));
    lower.cycle();
    assert!(f.sink.take().is_empty());

    f.resolver.bind("p1", 5);
    lower.notifier().notify_port_event(PortEvent::add("p1"));
    lower.cycle();
    assert!(!f.sink.take().is_empty());

    // gone from the bridge
    f.resolver.unbind("p1");
    lower.notifier().notify_port_event(PortEvent::del("p1"));
    lower.cycle();
    let ops = f.sink.take();
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|o| o.verb == Verb::Delete));
    assert!(lower.tenants().is_empty());
}

#[test]
fn vlan_removal_withdraws_rules() {
    let f = Fixture::new();
    let mut lower = f.lower();
    f.topology();
    f.vm("p1", HOST, 10);
    f.vm("p2", "host-b", 11);
    f.resolver.bind("p1", 5);
    lower.notifier().notify_port_event(PortEvent::add("p1"));
    lower.cycle();
    let installed = f.sink.take().len();

    assert!(f.db.delete(Table::Vlan, &vlan_key("tor1", "t1")));
    assert!(lower.cycle());
    let ops = f.sink.take();
    assert_eq!(ops.len(), installed);
    assert!(ops.iter().all(|o| o.verb == Verb::Delete));
    assert_eq!(ops[0].category, Category::Group);
    assert!(lower.flows().installed("t1").is_none());
}

#[test]
fn busy_sync_loop_defers_the_cycle() {
    let f = Fixture::new();
    let mut lower = f.lower();
    f.topology();
    f.vm("p1", HOST, 10);
    f.resolver.bind("p1", 5);
    lower.notifier().notify_port_event(PortEvent::add("p1"));

    assert!(f.gate.sync_enter());
    assert!(!lower.cycle());
    assert!(f.sink.ops().is_empty());

    f.gate.sync_idle();
    assert!(lower.cycle());
    assert!(!f.sink.ops().is_empty());
}

#[test]
fn switch_link_state_starts_unknown() {
    let f = Fixture::new();
    let mut lower = f.lower();

    // nothing synced yet is not a lost link
    lower.cycle();
    assert_eq!(lower.switch_link, None);

    f.topology();
    lower.cycle();
    assert_eq!(lower.switch_link, Some(true));

    assert!(f.db.delete(Table::HostLink, HOST));
    lower.cycle();
    assert_eq!(lower.switch_link, Some(false));

    f.topology();
    lower.cycle();
    assert_eq!(lower.switch_link, Some(true));
}
