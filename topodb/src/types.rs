// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The tables replicated from the controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Network,
    Subnet,
    Port,
    Vlan,
    HostLink,
}

impl Table {
    /// Order in which a full sync is requested. Parents come before
    /// children so most records arrive after the record they reference.
    pub const ALL: [Table; 5] = [
        Table::Vlan,
        Table::HostLink,
        Table::Network,
        Table::Subnet,
        Table::Port,
    ];
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Network => write!(f, "network"),
            Table::Subnet => write!(f, "subnet"),
            Table::Port => write!(f, "port"),
            Table::Vlan => write!(f, "vlan"),
            Table::HostLink => write!(f, "host-link"),
        }
    }
}

/// What a port is attached to, as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceOwner {
    RouterInterface,
    RouterGateway,
    Dhcp,
    FloatingIp,
    Compute(String),
    Other(String),
}

impl Default for DeviceOwner {
    fn default() -> Self {
        DeviceOwner::Other(String::new())
    }
}

impl DeviceOwner {
    /// Gateway and floating-ip ports model infrastructure, not tenant
    /// endpoints, and never take part in forwarding computation.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, DeviceOwner::RouterGateway | DeviceOwner::FloatingIp)
    }
}

impl From<String> for DeviceOwner {
    fn from(s: String) -> Self {
        match s.as_str() {
            "network:router_interface" => DeviceOwner::RouterInterface,
            "network:router_gateway" => DeviceOwner::RouterGateway,
            "network:dhcp" => DeviceOwner::Dhcp,
            "network:floatingip" => DeviceOwner::FloatingIp,
            x if x.starts_with("compute:") => DeviceOwner::Compute(s),
            _ => DeviceOwner::Other(s),
        }
    }
}

impl From<DeviceOwner> for String {
    fn from(d: DeviceOwner) -> Self {
        match d {
            DeviceOwner::RouterInterface => "network:router_interface".into(),
            DeviceOwner::RouterGateway => "network:router_gateway".into(),
            DeviceOwner::Dhcp => "network:dhcp".into(),
            DeviceOwner::FloatingIp => "network:floatingip".into(),
            DeviceOwner::Compute(s) | DeviceOwner::Other(s) => s,
        }
    }
}

/// An isolation domain. Tenants are created implicitly the first time one
/// of their networks is observed and are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub id: String,
    pub networks: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(skip)]
    pub id: String,
    pub tenant_id: String,
    #[serde(default, rename = "network_name")]
    pub name: String,
    #[serde(default)]
    pub network_type: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub segmentation_id: Option<u32>,
    #[serde(default)]
    pub md5sum: String,

    #[serde(skip)]
    pub subnets: BTreeSet<String>,
}

impl Network {
    pub fn is_flat(&self) -> bool {
        self.network_type == "flat"
    }

    /// Carry over bookkeeping that controller updates never include.
    pub fn inherit(&mut self, old: &Network) {
        self.subnets = old.subnets.clone();
    }
}

/// A router interface present on a subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gateway {
    pub mac: String,
    pub ip: String,
    pub route_id: u32,
}

impl Gateway {
    /// The source mac the router uses when it re-emits a packet onto a
    /// subnet: the gateway mac with its leading nibble replaced by `e`.
    pub fn router_mac(&self) -> String {
        let mut chars = self.mac.chars();
        chars.next();
        format!("e{}", chars.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(skip)]
    pub id: String,
    pub tenant_id: String,
    pub network_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub network: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub network_mask: String,
    #[serde(default)]
    pub enable_dhcp: bool,
    #[serde(default = "default_ip_version")]
    pub ip_version: u8,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub md5sum: String,

    #[serde(skip)]
    pub ports: BTreeSet<String>,
    /// Router interfaces on this subnet, keyed by router (device) id.
    #[serde(skip)]
    pub gateways: BTreeMap<String, Gateway>,
    #[serde(skip)]
    pub dhcp_mac: Option<String>,
    #[serde(skip)]
    pub dhcp_ip: Option<String>,
    #[serde(skip)]
    pub broadcast_id: u32,
}

impl Subnet {
    pub fn inherit(&mut self, old: &Subnet) {
        self.ports = old.ports.clone();
        self.gateways = old.gateways.clone();
        self.dhcp_mac = old.dhcp_mac.clone();
        self.dhcp_ip = old.dhcp_ip.clone();
        self.broadcast_id = old.broadcast_id;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    #[serde(skip)]
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub network_id: String,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub device_owner: DeviceOwner,
    #[serde(default)]
    pub device_id: String,
    #[serde(default, rename = "ip_address")]
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub md5sum: String,

    /// Switch port number, only known while the port is bound locally.
    #[serde(skip)]
    pub handle: Option<u32>,
}

impl Port {
    pub fn inherit(&mut self, old: &Port) {
        self.handle = old.handle;
    }
}

/// The segmentation id a tenant uses on the uplink towards one switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    #[serde(skip)]
    pub key: String,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub segmentation_id: Option<u32>,
    #[serde(default)]
    pub md5sum: String,
}

pub fn vlan_key(tor_id: &str, tenant_id: &str) -> String {
    format!("{tor_id}|{tenant_id}")
}

/// Split a vlan key into its switch-link id and tenant id.
pub fn split_vlan_key(key: &str) -> Result<(&str, &str), Error> {
    match key.split_once('|') {
        Some((tor, tenant)) if !tor.is_empty() && !tenant.is_empty() => {
            Ok((tor, tenant))
        }
        _ => Err(Error::BadKey(format!("vlan key {key}"))),
    }
}

/// Which physical switch a host is cabled to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostLink {
    pub host: String,
    pub tor_id: String,
    pub md5sum: String,
}

impl HostLink {
    /// Host link values name the switch either as the single key of an
    /// object or through an explicit `tor_ip` field.
    pub fn from_value(host: &str, value: &Value) -> Result<Self, Error> {
        let obj = value.as_object().ok_or_else(|| {
            Error::BadRecord(format!("host link {host}: expected object"))
        })?;
        let md5sum = obj
            .get("md5sum")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tor_id = match obj.get("tor_ip").and_then(Value::as_str) {
            Some(tor) => tor.to_string(),
            None => obj
                .keys()
                .filter(|k| k.as_str() != "md5sum")
                .last()
                .cloned()
                .ok_or_else(|| {
                    Error::BadRecord(format!("host link {host}: no switch"))
                })?,
        };
        Ok(HostLink {
            host: host.to_string(),
            tor_id,
            md5sum,
        })
    }
}

/// One record of any replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Network(Network),
    Subnet(Subnet),
    Port(Port),
    Vlan(Vlan),
    HostLink(HostLink),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::Network(_) => Table::Network,
            Record::Subnet(_) => Table::Subnet,
            Record::Port(_) => Table::Port,
            Record::Vlan(_) => Table::Vlan,
            Record::HostLink(_) => Table::HostLink,
        }
    }

    pub fn md5sum(&self) -> &str {
        match self {
            Record::Network(x) => &x.md5sum,
            Record::Subnet(x) => &x.md5sum,
            Record::Port(x) => &x.md5sum,
            Record::Vlan(x) => &x.md5sum,
            Record::HostLink(x) => &x.md5sum,
        }
    }

    /// Decode the JSON value the controller sent for `key` in `table`.
    pub fn from_json(
        table: Table,
        key: &str,
        value: Value,
    ) -> Result<Record, Error> {
        let r = match table {
            Table::Network => {
                let mut x: Network = serde_json::from_value(value)?;
                x.id = key.to_string();
                Record::Network(x)
            }
            Table::Subnet => {
                let mut x: Subnet = serde_json::from_value(value)?;
                x.id = key.to_string();
                Record::Subnet(x)
            }
            Table::Port => {
                let mut x: Port = serde_json::from_value(value)?;
                x.id = key.to_string();
                Record::Port(x)
            }
            Table::Vlan => {
                split_vlan_key(key)?;
                let mut x: Vlan = serde_json::from_value(value)?;
                x.key = key.to_string();
                Record::Vlan(x)
            }
            Table::HostLink => Record::HostLink(HostLink::from_value(key, &value)?),
        };
        Ok(r)
    }
}

/// Local port lifecycle signal consumed by the recompute scheduler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortEventKind {
    Add,
    Del,
}

impl fmt::Display for PortEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortEventKind::Add => write!(f, "ADD"),
            PortEventKind::Del => write!(f, "DEL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub port_id: String,
    pub kind: PortEventKind,
}

impl PortEvent {
    pub fn add(port_id: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            kind: PortEventKind::Add,
        }
    }

    pub fn del(port_id: impl Into<String>) -> Self {
        Self {
            port_id: port_id.into(),
            kind: PortEventKind::Del,
        }
    }
}

/// A port as seen by flow compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortView {
    pub id: String,
    pub mac: String,
    pub ip: String,
    pub owner: DeviceOwner,
    /// Bound on this host. Local ports always carry a handle once they are
    /// resolved against the switch.
    pub local: bool,
    pub handle: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetView {
    pub id: String,
    pub broadcast_id: u32,
    pub gateways: BTreeMap<String, Gateway>,
    pub ports: Vec<PortView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkView {
    pub id: String,
    pub flat: bool,
    pub subnets: Vec<SubnetView>,
}

/// Consistent snapshot of everything one tenant's flows are derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantView {
    pub tenant_id: String,
    /// Segmentation id on the local uplink, if the local host link and the
    /// tenant's vlan assignment are both known.
    pub vlan: Option<u32>,
    pub networks: Vec<NetworkView>,
}

fn default_true() -> bool {
    true
}

fn default_ip_version() -> u8 {
    4
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrText {
    Num(u64),
    Text(String),
}

/// Accept a number, a numeric string, an empty string or null.
fn lenient_u32<'de, D>(d: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    match Option::<NumOrText>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrText::Num(n)) => {
            u32::try_from(n).map(Some).map_err(D::Error::custom)
        }
        Some(NumOrText::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrText::Text(s)) => {
            s.trim().parse().map(Some).map_err(D::Error::custom)
        }
    }
}

fn lenient_string<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NumOrText>::deserialize(d)? {
        None => String::new(),
        Some(NumOrText::Num(n)) => n.to_string(),
        Some(NumOrText::Text(s)) => s,
    })
}

fn non_empty_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(d)?.filter(|s| !s.is_empty()))
}
