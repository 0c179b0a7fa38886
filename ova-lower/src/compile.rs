// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derive the switch rules for one tenant.
//!
//! The integration bridge runs a four table pipeline:
//!
//! ```text
//!   table 0  identify   tag the packet with its subnet (broadcast id) or
//!                       router (route id) as metadata
//!   table 1  forward    l2 lookup on metadata + vlan + destination mac
//!   table 2  route      l3 lookup on route id + destination ip
//!   table 3  broadcast  flood through the subnet's group
//! ```
//!
//! Rules are ovs-ofctl text. Each rule's match key is the text ahead of its
//! actions and its action key is the whole text, so two compiled rules are
//! the same installed rule exactly when their texts are equal.

use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use topodb::{DeviceOwner, Gateway, PortView, SubnetView, TenantView};

pub const PRIORITY_GATEWAY: u32 = 2000;
pub const PRIORITY_UNICAST: u32 = 1000;
pub const PRIORITY_DEFAULT_ROUTE: u32 = 500;
pub const PRIORITY_BROADCAST: u32 = 100;
pub const PRIORITY_MISS: u32 = 1;

/// Untagged traffic in a `dl_vlan` match.
const NO_VLAN: &str = "0xffff";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Identify,
    Forward,
    Route,
    Group,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Identify,
        Category::Forward,
        Category::Route,
        Category::Group,
    ];

    /// Groups go first since flow rules refer to them.
    pub const FLUSH_ORDER: [Category; 4] = [
        Category::Group,
        Category::Identify,
        Category::Forward,
        Category::Route,
    ];

    pub fn is_group(self) -> bool {
        self == Category::Group
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Identify => write!(f, "identify"),
            Category::Forward => write!(f, "forward"),
            Category::Route => write!(f, "route"),
            Category::Group => write!(f, "group"),
        }
    }
}

/// The match part of a rule: everything before `actions=` for flows and
/// before `type=` for groups.
pub fn match_key(category: Category, text: &str) -> &str {
    let sep = if category.is_group() {
        "type="
    } else {
        "actions="
    };
    let m = match text.find(sep) {
        Some(i) => &text[..i],
        None => text,
    };
    m.trim_end_matches(',')
}

/// Compiled rules keyed by category, then match key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<Category, BTreeMap<String, String>>,
}

impl RuleSet {
    pub fn insert(&mut self, category: Category, text: String) {
        let key = match_key(category, &text).to_string();
        self.rules.entry(category).or_default().insert(key, text);
    }

    pub fn category(&self, category: Category) -> Option<&BTreeMap<String, String>> {
        self.rules.get(&category)
    }

    /// Rule texts of a category in match key order.
    pub fn texts(&self, category: Category) -> Vec<&str> {
        self.category(category)
            .map(|m| m.values().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rules installed once at start-up, below every compiled rule.
pub fn miss_rules() -> Vec<String> {
    let mut v: Vec<String> = (0..4)
        .map(|t| format!("table={t},priority={PRIORITY_MISS},actions=drop"))
        .collect();
    v.push(format!(
        "table=1,priority={PRIORITY_BROADCAST},dl_dst=ff:ff:ff:ff:ff:ff,\
         actions=goto_table:3"
    ));
    v
}

/// Compile every rule a tenant needs on this host. Local ports without a
/// switch handle are left out. Without a vlan only flat networks produce
/// rules, which withdraws everything else the tenant had installed.
pub fn compile(view: &TenantView, uplink: u32) -> RuleSet {
    let mut rs = RuleSet::default();

    for net in view.networks.iter().filter(|n| n.flat) {
        for s in &net.subnets {
            for h in local_ports(s).filter_map(|p| p.handle) {
                rs.insert(
                    Category::Identify,
                    format!(
                        "table=0,priority={PRIORITY_UNICAST},in_port={h},\
                         actions=normal"
                    ),
                );
            }
        }
    }

    let Some(vlan) = view.vlan else {
        return rs;
    };
    let c = Compiler { vlan, uplink };

    let subnets: Vec<&SubnetView> = view
        .networks
        .iter()
        .filter(|n| !n.flat)
        .flat_map(|n| n.subnets.iter())
        .collect();

    // routers with a member port on this host
    let mut local_routers = BTreeSet::new();

    for s in subnets.iter().filter(|s| local_ports(s).next().is_some()) {
        c.identify(&mut rs, s);
        c.broadcast(&mut rs, s);
        c.forward(&mut rs, s);
        for (router, gw) in &s.gateways {
            c.local_routes(&mut rs, s, gw);
            local_routers.insert(router.as_str());
        }
    }

    for s in &subnets {
        for (_, gw) in s
            .gateways
            .iter()
            .filter(|(r, _)| local_routers.contains(r.as_str()))
        {
            c.remote_routes(&mut rs, s, gw);
        }
    }

    rs
}

fn local_ports(s: &SubnetView) -> impl Iterator<Item = &PortView> {
    s.ports.iter().filter(|p| p.local && p.handle.is_some())
}

fn remote_ports(s: &SubnetView) -> impl Iterator<Item = &PortView> {
    s.ports.iter().filter(|p| !p.local)
}

struct Compiler {
    vlan: u32,
    uplink: u32,
}

impl Compiler {
    fn identify(&self, rs: &mut RuleSet, s: &SubnetView) {
        let (vlan, bc) = (self.vlan, s.broadcast_id);
        for p in local_ports(s) {
            rs.insert(
                Category::Identify,
                format!(
                    "table=0,priority={PRIORITY_UNICAST},dl_vlan={NO_VLAN},\
                     dl_src={},actions=mod_vlan_vid:{vlan},write_metadata:{bc},\
                     goto_table:1",
                    p.mac
                ),
            );
        }
        for p in remote_ports(s) {
            rs.insert(
                Category::Identify,
                format!(
                    "table=0,priority={PRIORITY_UNICAST},dl_vlan={vlan},\
                     dl_src={},actions=write_metadata:{bc},goto_table:1",
                    p.mac
                ),
            );
        }
    }

    /// A flood group for the subnet. One local port and nobody remote has
    /// no one to flood to.
    fn broadcast(&self, rs: &mut RuleSet, s: &SubnetView) {
        let bc = s.broadcast_id;
        let handles: BTreeSet<u32> =
            local_ports(s).filter_map(|p| p.handle).collect();
        let remote = remote_ports(s).next().is_some();
        if !remote && handles.len() < 2 {
            return;
        }

        rs.insert(
            Category::Identify,
            format!(
                "table=3,priority={PRIORITY_BROADCAST},metadata={bc},\
                 actions=group:{bc}"
            ),
        );

        let uplink = remote.then(|| format!("bucket=output:{}", self.uplink));
        let buckets = uplink
            .into_iter()
            .chain(handles.iter().map(|h| format!("bucket=strip_vlan,output:{h}")))
            .join(",");
        rs.insert(
            Category::Group,
            format!("group_id={bc},type=all,{buckets}"),
        );
    }

    fn forward(&self, rs: &mut RuleSet, s: &SubnetView) {
        let (vlan, bc) = (self.vlan, s.broadcast_id);
        for p in local_ports(s) {
            let Some(h) = p.handle else { continue };
            rs.insert(
                Category::Forward,
                format!(
                    "table=1,priority={PRIORITY_UNICAST},metadata={bc},\
                     dl_vlan={vlan},dl_dst={},actions=strip_vlan,output:{h}",
                    p.mac
                ),
            );
        }
        for p in remote_ports(s) {
            rs.insert(
                Category::Forward,
                format!(
                    "table=1,priority={PRIORITY_UNICAST},metadata={bc},\
                     dl_vlan={vlan},dl_dst={},actions=output:{}",
                    p.mac, self.uplink
                ),
            );
        }
    }

    /// Rules for a router interface on a subnet with local ports: steer
    /// traffic for the gateway into the route table, recognize packets the
    /// router re-emitted and deliver routed packets to local ports.
    fn local_routes(&self, rs: &mut RuleSet, s: &SubnetView, gw: &Gateway) {
        let (vlan, rid) = (self.vlan, gw.route_id);
        let router_mac = gw.router_mac();

        rs.insert(
            Category::Forward,
            format!(
                "table=1,priority={PRIORITY_GATEWAY},ip,dl_vlan={vlan},\
                 dl_dst={},actions=write_metadata:{rid},goto_table:2",
                gw.mac
            ),
        );
        rs.insert(
            Category::Identify,
            format!(
                "table=0,priority={PRIORITY_UNICAST},dl_vlan={vlan},\
                 dl_src={router_mac},actions=write_metadata:{rid},goto_table:2"
            ),
        );

        for p in local_ports(s) {
            let Some(h) = p.handle else { continue };
            rs.insert(
                Category::Route,
                format!(
                    "table=2,priority={PRIORITY_UNICAST},metadata={rid},ip,\
                     nw_dst={},dl_vlan={vlan},actions=strip_vlan,\
                     set_field:{}->dl_dst,output:{h}",
                    p.ip, p.mac
                ),
            );
        }

        let router_port = local_ports(s)
            .filter(|p| p.owner == DeviceOwner::RouterInterface)
            .filter_map(|p| p.handle)
            .min();
        let action = match router_port {
            Some(h) => format!("strip_vlan,output:{h}"),
            None => format!("set_field:{router_mac}->dl_src,output:{}", self.uplink),
        };
        rs.insert(
            Category::Route,
            format!(
                "table=2,priority={PRIORITY_DEFAULT_ROUTE},metadata={rid},\
                 dl_dst={},ip,dl_vlan={vlan},actions={action}",
                gw.mac
            ),
        );
    }

    /// Routed traffic for ports on other hosts leaves through the uplink
    /// as if the router had emitted it.
    fn remote_routes(&self, rs: &mut RuleSet, s: &SubnetView, gw: &Gateway) {
        let rid = gw.route_id;
        let router_mac = gw.router_mac();
        for p in remote_ports(s) {
            rs.insert(
                Category::Route,
                format!(
                    "table=2,priority={PRIORITY_UNICAST},metadata={rid},ip,\
                     nw_dst={},actions=set_field:{router_mac}->dl_src,\
                     set_field:{}->dl_dst,output:{}",
                    p.ip, p.mac, self.uplink
                ),
            );
        }
    }
}
