// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::log::topo_log;
use crate::pool::IdPool;
use crate::types::*;
use ova_common::{lock, read_lock, write_lock};
use serde::Serialize;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};

/// Outcome of applying a create or update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    Applied,

    /// The record names a parent that is not known yet. The store was left
    /// untouched and the record should be replayed later.
    Deferred,
}

/// A virtual router seen through its interface ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Router {
    pub route_id: u32,

    /// Subnet id to the router interface ports attached on that subnet.
    pub members: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologyData {
    pub tenants: BTreeMap<String, Tenant>,
    pub networks: BTreeMap<String, Network>,
    pub subnets: BTreeMap<String, Subnet>,
    pub ports: BTreeMap<String, Port>,
    pub vlans: BTreeMap<String, Vlan>,
    pub links: BTreeMap<String, HostLink>,

    /// Keyed by router (device) id.
    pub routers: BTreeMap<String, Router>,
    pub broadcast_ids: IdPool,
    pub router_ids: IdPool,

    /// Tenants whose uplink vlan may have changed since the last recompute.
    pub vlan_changed: BTreeSet<String>,
}

#[derive(Clone)]
struct Watcher {
    tag: String,
    sender: SyncSender<PortEvent>,
}

/// The topology replica. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct Db {
    data: Arc<Mutex<TopologyData>>,

    /// Consumers of port events.
    watchers: Arc<RwLock<Vec<Watcher>>>,

    /// Name of the host this agent runs on.
    host: String,

    log: Logger,
}

impl Db {
    pub fn new(host: &str, log: Logger) -> Self {
        Self {
            data: Arc::new(Mutex::new(TopologyData::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            host: host.to_string(),
            log,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Register a port event consumer.
    pub fn watch(&self, tag: &str, sender: SyncSender<PortEvent>) {
        write_lock!(self.watchers).push(Watcher {
            tag: tag.to_string(),
            sender,
        });
    }

    fn notify(&self, events: Vec<PortEvent>) {
        for e in events {
            for Watcher { tag, sender } in read_lock!(self.watchers).iter() {
                match sender.try_send(e.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(e)) => {
                        topo_log!(self, warn,
                            "event queue '{}' full, dropping {} {}",
                            tag, e.kind, e.port_id
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        topo_log!(self, error,
                            "event queue '{}' disconnected", tag
                        );
                    }
                }
            }
        }
    }

    pub fn dump(&self) -> TopologyData {
        lock!(self.data).clone()
    }

    pub fn lookup(&self, table: Table, key: &str) -> Option<Record> {
        let data = lock!(self.data);
        match table {
            Table::Network => data.networks.get(key).cloned().map(Record::Network),
            Table::Subnet => data.subnets.get(key).cloned().map(Record::Subnet),
            Table::Port => data.ports.get(key).cloned().map(Record::Port),
            Table::Vlan => data.vlans.get(key).cloned().map(Record::Vlan),
            Table::HostLink => {
                data.links.get(key).cloned().map(Record::HostLink)
            }
        }
    }

    pub fn tenant(&self, id: &str) -> Option<Tenant> {
        lock!(self.data).tenants.get(id).cloned()
    }

    pub fn network(&self, id: &str) -> Option<Network> {
        lock!(self.data).networks.get(id).cloned()
    }

    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        lock!(self.data).subnets.get(id).cloned()
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        lock!(self.data).ports.get(id).cloned()
    }

    pub fn router(&self, id: &str) -> Option<Router> {
        lock!(self.data).routers.get(id).cloned()
    }

    /// The host link record of the host this agent runs on.
    pub fn local_link(&self) -> Option<HostLink> {
        lock!(self.data).links.get(&self.host).cloned()
    }

    /// Key to checksum view of a table.
    pub fn checksums(&self, table: Table) -> BTreeMap<String, String> {
        let data = lock!(self.data);
        fn sums<T>(
            m: &BTreeMap<String, T>,
            f: impl Fn(&T) -> &str,
        ) -> BTreeMap<String, String> {
            m.iter().map(|(k, v)| (k.clone(), f(v).to_string())).collect()
        }
        match table {
            Table::Network => sums(&data.networks, |x| x.md5sum.as_str()),
            Table::Subnet => sums(&data.subnets, |x| x.md5sum.as_str()),
            Table::Port => sums(&data.ports, |x| x.md5sum.as_str()),
            Table::Vlan => sums(&data.vlans, |x| x.md5sum.as_str()),
            Table::HostLink => sums(&data.links, |x| x.md5sum.as_str()),
        }
    }

    /// Create a record, or update it if the key is already known.
    pub fn add(&self, record: Record) -> Result<Apply, Error> {
        self.upsert(record)
    }

    /// Update a record. Derived bookkeeping of the existing record (child
    /// sets, gateways, dhcp, allocated ids, switch handles) is preserved.
    /// An unknown key is created.
    pub fn update(&self, record: Record) -> Result<Apply, Error> {
        self.upsert(record)
    }

    fn upsert(&self, record: Record) -> Result<Apply, Error> {
        let mut events = Vec::new();
        let result = {
            let mut guard = lock!(self.data);
            let data = &mut *guard;
            match record {
                Record::Network(x) => Ok(self.upsert_network(data, x)),
                Record::Subnet(x) => Ok(self.upsert_subnet(data, x)),
                Record::Port(x) => Ok(self.upsert_port(data, x, &mut events)),
                Record::Vlan(x) => self.upsert_vlan(data, x),
                Record::HostLink(x) => Ok(self.upsert_link(data, x)),
            }
        };
        self.notify(events);
        result
    }

    /// Delete a record along with everything that depends on it. Returns
    /// false if the key was not present.
    pub fn delete(&self, table: Table, key: &str) -> bool {
        let mut events = Vec::new();
        let found = {
            let mut guard = lock!(self.data);
            let data = &mut *guard;
            match table {
                Table::Network => self.delete_network(data, key, &mut events),
                Table::Subnet => self.delete_subnet(data, key, &mut events),
                Table::Port => self.delete_port(data, key, &mut events),
                Table::Vlan => self.delete_vlan(data, key),
                Table::HostLink => self.delete_link(data, key),
            }
        };
        if !found {
            topo_log!(self, debug, "delete of unknown {} {}", table, key);
        }
        self.notify(events);
        found
    }

    /// Delete every record of a table through the regular cascading path.
    pub fn clear(&self, table: Table) -> usize {
        let keys: Vec<String> = self.checksums(table).into_keys().collect();
        keys.iter().filter(|k| self.delete(table, k)).count()
    }

    /// Record the local switch handle of a port. Returns false if the port
    /// is unknown.
    pub fn set_port_handle(&self, port_id: &str, handle: Option<u32>) -> bool {
        match lock!(self.data).ports.get_mut(port_id) {
            Some(p) => {
                p.handle = handle;
                true
            }
            None => false,
        }
    }

    pub fn mark_vlan_changed(&self, tenant_id: &str) {
        lock!(self.data).vlan_changed.insert(tenant_id.to_string());
    }

    /// Drain the set of tenants whose vlan changed.
    pub fn take_vlan_changes(&self) -> BTreeSet<String> {
        std::mem::take(&mut lock!(self.data).vlan_changed)
    }

    /// Snapshot everything the flows of a tenant are derived from. An
    /// unknown tenant yields an empty view.
    pub fn tenant_view(&self, tenant_id: &str) -> TenantView {
        let data = lock!(self.data);

        let vlan = data
            .links
            .get(&self.host)
            .and_then(|l| data.vlans.get(&vlan_key(&l.tor_id, tenant_id)))
            .and_then(|v| v.segmentation_id);

        let mut view = TenantView {
            tenant_id: tenant_id.to_string(),
            vlan,
            networks: Vec::new(),
        };
        let Some(tenant) = data.tenants.get(tenant_id) else {
            return view;
        };

        for n in tenant.networks.iter().filter_map(|id| data.networks.get(id)) {
            let subnets = n
                .subnets
                .iter()
                .filter_map(|id| data.subnets.get(id))
                .map(|s| SubnetView {
                    id: s.id.clone(),
                    broadcast_id: s.broadcast_id,
                    gateways: s.gateways.clone(),
                    ports: s
                        .ports
                        .iter()
                        .filter_map(|id| data.ports.get(id))
                        .filter(|p| !p.device_owner.is_infrastructure())
                        .map(|p| PortView {
                            id: p.id.clone(),
                            mac: p.mac.clone(),
                            ip: p.ip.clone(),
                            owner: p.device_owner.clone(),
                            local: p.host_name == self.host,
                            handle: p.handle,
                        })
                        .collect(),
                })
                .collect();
            view.networks.push(NetworkView {
                id: n.id.clone(),
                flat: n.is_flat(),
                subnets,
            });
        }
        view
    }

    fn upsert_network(&self, data: &mut TopologyData, mut n: Network) -> Apply {
        let key = n.id.clone();
        match data.networks.get(&key) {
            Some(old) => {
                n.inherit(old);
                if old.tenant_id != n.tenant_id {
                    if let Some(t) = data.tenants.get_mut(&old.tenant_id) {
                        t.networks.remove(&key);
                    }
                }
                topo_log!(self, debug, "network updated"; "network" => &key);
            }
            None => {
                topo_log!(self, debug, "network added"; "network" => &key);
            }
        }
        data.tenants
            .entry(n.tenant_id.clone())
            .or_insert_with(|| Tenant {
                id: n.tenant_id.clone(),
                networks: BTreeSet::new(),
            })
            .networks
            .insert(key.clone());
        data.networks.insert(key, n);
        Apply::Applied
    }

    fn upsert_subnet(&self, data: &mut TopologyData, mut s: Subnet) -> Apply {
        let key = s.id.clone();
        if !data.networks.contains_key(&s.network_id) {
            topo_log!(self, warn, "subnet arrived before its network";
                "subnet" => &key,
                "network" => &s.network_id
            );
            return Apply::Deferred;
        }

        match data.subnets.get(&key) {
            Some(old) => {
                s.inherit(old);
                if old.network_id != s.network_id {
                    if let Some(n) = data.networks.get_mut(&old.network_id) {
                        n.subnets.remove(&key);
                    }
                }
                topo_log!(self, debug, "subnet updated"; "subnet" => &key);
            }
            None => {
                s.broadcast_id = data.broadcast_ids.alloc();
                topo_log!(self, debug, "subnet added";
                    "subnet" => &key,
                    "broadcast_id" => s.broadcast_id
                );
            }
        }

        if let Some(n) = data.networks.get_mut(&s.network_id) {
            n.subnets.insert(key.clone());
        }
        data.subnets.insert(key, s);
        Apply::Applied
    }

    fn upsert_port(
        &self,
        data: &mut TopologyData,
        mut p: Port,
        events: &mut Vec<PortEvent>,
    ) -> Apply {
        let key = p.id.clone();
        let old = data.ports.get(&key).cloned();

        // Infrastructure ports are kept for checksum tracking only.
        if p.device_owner.is_infrastructure() {
            if let Some(old) = &old {
                self.detach_port(data, old);
            }
            data.ports.insert(key, p);
            return Apply::Applied;
        }

        if let Some(subnet_id) = &p.subnet_id {
            if !data.subnets.contains_key(subnet_id) {
                topo_log!(self, warn, "port arrived before its subnet";
                    "port" => &key,
                    "subnet" => subnet_id
                );
                return Apply::Deferred;
            }
        }

        match old {
            Some(old) => {
                p.inherit(&old);
                if !same_attachment(&old, &p) {
                    self.detach_port(data, &old);
                }
                self.attach_port(data, &p);
                let linked = p.subnet_id.is_some() || old.subnet_id.is_some();
                data.ports.insert(key.clone(), p);
                topo_log!(self, debug, "port updated"; "port" => &key);
                if linked {
                    events.push(PortEvent::add(key));
                }
            }
            None => {
                self.attach_port(data, &p);
                // Local ports are announced by the local port monitor once
                // they show up on the switch.
                let announce = p.subnet_id.is_some() && p.host_name != self.host;
                data.ports.insert(key.clone(), p);
                topo_log!(self, debug, "port added"; "port" => &key);
                if announce {
                    events.push(PortEvent::add(key));
                }
            }
        }
        Apply::Applied
    }

    /// Link a port into its subnet and apply router/dhcp side effects.
    /// Idempotent for a port that is already attached.
    fn attach_port(&self, data: &mut TopologyData, p: &Port) {
        let Some(subnet_id) = &p.subnet_id else {
            return;
        };
        let Some(subnet) = data.subnets.get_mut(subnet_id) else {
            return;
        };
        subnet.ports.insert(p.id.clone());

        match p.device_owner {
            DeviceOwner::RouterInterface => {
                if !data.routers.contains_key(&p.device_id) {
                    let route_id = data.router_ids.alloc();
                    topo_log!(self, debug, "router added";
                        "router" => &p.device_id,
                        "route_id" => route_id
                    );
                    data.routers.insert(
                        p.device_id.clone(),
                        Router {
                            route_id,
                            members: BTreeMap::new(),
                        },
                    );
                }
                let Some(router) = data.routers.get_mut(&p.device_id) else {
                    return;
                };
                router
                    .members
                    .entry(subnet_id.clone())
                    .or_default()
                    .insert(p.id.clone());
                subnet.gateways.insert(
                    p.device_id.clone(),
                    Gateway {
                        mac: p.mac.clone(),
                        ip: p.ip.clone(),
                        route_id: router.route_id,
                    },
                );
            }
            DeviceOwner::Dhcp => {
                subnet.dhcp_mac = Some(p.mac.clone());
                subnet.dhcp_ip = Some(p.ip.clone());
            }
            _ => {}
        }
    }

    /// Undo `attach_port`. The router id is released once the router has
    /// no interface left on any subnet.
    fn detach_port(&self, data: &mut TopologyData, p: &Port) {
        let Some(subnet_id) = &p.subnet_id else {
            return;
        };
        let mut subnet = data.subnets.get_mut(subnet_id);
        if let Some(s) = subnet.as_mut() {
            s.ports.remove(&p.id);
        }

        match p.device_owner {
            DeviceOwner::RouterInterface => {
                let Some(router) = data.routers.get_mut(&p.device_id) else {
                    return;
                };
                if let Some(ports) = router.members.get_mut(subnet_id) {
                    ports.remove(&p.id);
                    // the gateway follows a surviving interface, if any
                    let survivor = ports
                        .iter()
                        .filter_map(|id| data.ports.get(id))
                        .find(|q| q.id != p.id);
                    match (survivor, subnet.as_mut()) {
                        (Some(q), Some(s)) => {
                            s.gateways.insert(
                                p.device_id.clone(),
                                Gateway {
                                    mac: q.mac.clone(),
                                    ip: q.ip.clone(),
                                    route_id: router.route_id,
                                },
                            );
                        }
                        (None, Some(s)) => {
                            s.gateways.remove(&p.device_id);
                        }
                        _ => {}
                    }
                    if ports.is_empty() {
                        router.members.remove(subnet_id);
                    }
                }
                if router.members.is_empty() {
                    let route_id = router.route_id;
                    data.routers.remove(&p.device_id);
                    data.router_ids.release(route_id);
                    topo_log!(self, debug, "router released";
                        "router" => &p.device_id,
                        "route_id" => route_id
                    );
                }
            }
            DeviceOwner::Dhcp => {
                if let Some(s) = subnet {
                    s.dhcp_mac = None;
                    s.dhcp_ip = None;
                }
            }
            _ => {}
        }
    }

    fn upsert_vlan(
        &self,
        data: &mut TopologyData,
        v: Vlan,
    ) -> Result<Apply, Error> {
        let (_, tenant_id) = split_vlan_key(&v.key)?;
        data.vlan_changed.insert(tenant_id.to_string());
        topo_log!(self, debug, "vlan set";
            "key" => &v.key,
            "segmentation_id" => v.segmentation_id
        );
        data.vlans.insert(v.key.clone(), v);
        Ok(Apply::Applied)
    }

    fn upsert_link(&self, data: &mut TopologyData, l: HostLink) -> Apply {
        let local = l.host == self.host;
        let host = l.host.clone();
        let tor = l.tor_id.clone();
        let old = data.links.insert(host.clone(), l);
        let moved = old.map_or(true, |o| o.tor_id != tor);
        if local && moved {
            topo_log!(self, info, "local host link changed"; "switch" => &tor);
            let tenants: Vec<String> = data.tenants.keys().cloned().collect();
            data.vlan_changed.extend(tenants);
        }
        topo_log!(self, debug, "host link set";
            "host" => &host,
            "switch" => &tor
        );
        Apply::Applied
    }

    fn delete_network(
        &self,
        data: &mut TopologyData,
        key: &str,
        events: &mut Vec<PortEvent>,
    ) -> bool {
        let Some(subnets) = data.networks.get(key).map(|n| n.subnets.clone())
        else {
            return false;
        };
        for s in &subnets {
            self.delete_subnet(data, s, events);
        }
        if let Some(n) = data.networks.remove(key) {
            if let Some(t) = data.tenants.get_mut(&n.tenant_id) {
                t.networks.remove(key);
            }
        }
        topo_log!(self, debug, "network deleted"; "network" => key);
        true
    }

    fn delete_subnet(
        &self,
        data: &mut TopologyData,
        key: &str,
        events: &mut Vec<PortEvent>,
    ) -> bool {
        let Some(ports) = data.subnets.get(key).map(|s| s.ports.clone()) else {
            return false;
        };
        for p in &ports {
            self.delete_port(data, p, events);
        }
        if let Some(s) = data.subnets.remove(key) {
            if let Some(n) = data.networks.get_mut(&s.network_id) {
                n.subnets.remove(key);
            }
            data.broadcast_ids.release(s.broadcast_id);
            topo_log!(self, debug, "subnet deleted";
                "subnet" => key,
                "broadcast_id" => s.broadcast_id
            );
        }
        true
    }

    fn delete_port(
        &self,
        data: &mut TopologyData,
        key: &str,
        events: &mut Vec<PortEvent>,
    ) -> bool {
        let Some(p) = data.ports.remove(key) else {
            return false;
        };
        topo_log!(self, debug, "port deleted"; "port" => key);
        if p.device_owner.is_infrastructure() {
            return true;
        }
        self.detach_port(data, &p);
        if p.subnet_id.is_some() {
            events.push(PortEvent::del(key));
        }
        true
    }

    fn delete_vlan(&self, data: &mut TopologyData, key: &str) -> bool {
        if data.vlans.remove(key).is_none() {
            return false;
        }
        if let Ok((_, tenant_id)) = split_vlan_key(key) {
            data.vlan_changed.insert(tenant_id.to_string());
        }
        topo_log!(self, debug, "vlan deleted"; "key" => key);
        true
    }

    fn delete_link(&self, data: &mut TopologyData, key: &str) -> bool {
        if data.links.remove(key).is_none() {
            return false;
        }
        if key == self.host {
            topo_log!(self, warn, "local host link removed");
            let tenants: Vec<String> = data.tenants.keys().cloned().collect();
            data.vlan_changed.extend(tenants);
        }
        true
    }
}

fn same_attachment(a: &Port, b: &Port) -> bool {
    a.subnet_id == b.subnet_id
        && a.device_owner == b.device_owner
        && a.device_id == b.device_id
}
