// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits that decouple rule computation from the local virtual switch.
//! Production shells out to the Open vSwitch command line tools; tests use
//! the recording implementations at the bottom of this file.

use crate::compile::{match_key, Category};
use crate::error::Error;
use crate::log::lower_log;
use slog::Logger;
use std::collections::BTreeSet;
use std::process::Command;

const UNIT_SINK: &str = "sink";

/// Executes rule changes against the switch. Failures are reported by the
/// implementation and never retried.
pub trait SwitchSink {
    /// Apply one category worth of changes. Deletions carry the full rule
    /// text; the sink derives whatever identifies the rule on the switch.
    fn install(
        &self,
        category: Category,
        add: &[String],
        modify: &[String],
        delete: &[String],
    );

    /// Remove every group on the switch.
    fn clear_groups(&self);
}

/// Maps controller port ids to switch port handles on this host.
pub trait PortResolver {
    /// The switch handle of the interface bound to `port_id`, if any.
    fn ofport(&self, port_id: &str) -> Result<Option<u32>, Error>;

    /// Ids of all ports currently bound on the local bridge.
    fn local_ports(&self) -> Result<BTreeSet<String>, Error>;
}

impl<T: SwitchSink + ?Sized> SwitchSink for &T {
    fn install(
        &self,
        category: Category,
        add: &[String],
        modify: &[String],
        delete: &[String],
    ) {
        (**self).install(category, add, modify, delete)
    }

    fn clear_groups(&self) {
        (**self).clear_groups()
    }
}

impl<T: PortResolver + ?Sized> PortResolver for &T {
    fn ofport(&self, port_id: &str) -> Result<Option<u32>, Error> {
        (**self).ofport(port_id)
    }

    fn local_ports(&self) -> Result<BTreeSet<String>, Error> {
        (**self).local_ports()
    }
}

fn run(program: &str, args: &[&str]) -> Result<String, Error> {
    let out = Command::new(program).args(args).output()?;
    if !out.status.success() {
        return Err(Error::Command {
            command: format!("{program} {}", args.join(" ")),
            status: out.status.to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// OpenFlow 1.3 rules through `ovs-ofctl`.
pub struct OfctlSink {
    pub bridge: String,
    log: Logger,
}

impl OfctlSink {
    pub fn new(bridge: &str, log: Logger) -> Self {
        Self {
            bridge: bridge.to_string(),
            log,
        }
    }

    fn ofctl(&self, cmd: &str, strict: bool, arg: Option<&str>) {
        let mut args = vec!["-O", "OpenFlow13"];
        if strict {
            args.push("--strict");
        }
        args.push(cmd);
        args.push(self.bridge.as_str());
        if let Some(a) = arg {
            args.push(a);
        }
        match run("ovs-ofctl", &args) {
            Ok(_) => {
                lower_log!(self, debug, "ovs-ofctl {}", cmd;
                    "rule" => arg.unwrap_or_default()
                );
            }
            Err(e) => {
                lower_log!(self, error, "switch command failed: {}", e);
            }
        }
    }
}

impl SwitchSink for OfctlSink {
    fn install(
        &self,
        category: Category,
        add: &[String],
        modify: &[String],
        delete: &[String],
    ) {
        let group = category.is_group();
        let (add_cmd, mod_cmd, del_cmd) = if group {
            ("add-group", "mod-group", "del-groups")
        } else {
            ("add-flow", "mod-flows", "del-flows")
        };
        for r in add {
            self.ofctl(add_cmd, false, Some(r));
        }
        for r in modify {
            self.ofctl(mod_cmd, !group, Some(r));
        }
        for r in delete {
            self.ofctl(del_cmd, !group, Some(match_key(category, r)));
        }
    }

    fn clear_groups(&self) {
        self.ofctl("del-groups", false, None);
    }
}

/// Interface lookups through `ovs-vsctl`. Ports are matched on the
/// `external_ids:iface-id` the compute service stamps on each interface.
pub struct OvsResolver {
    pub bridge: String,
}

impl OvsResolver {
    pub fn new(bridge: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
        }
    }
}

/// `ovs-vsctl` prints strings quoted and missing map keys as nothing.
fn unquote(s: &str) -> &str {
    s.trim().trim_matches('"')
}

/// An ofport of `-1` or `[]` means the interface is not attached yet.
fn parse_ofport(s: &str) -> Option<u32> {
    s.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

impl PortResolver for OvsResolver {
    fn ofport(&self, port_id: &str) -> Result<Option<u32>, Error> {
        let cond = format!("external_ids:iface-id=\"{port_id}\"");
        let out = run(
            "ovs-vsctl",
            &["--bare", "--columns=ofport", "find", "Interface", cond.as_str()],
        )?;
        Ok(parse_ofport(&out))
    }

    fn local_ports(&self) -> Result<BTreeSet<String>, Error> {
        let ifaces = run("ovs-vsctl", &["list-ifaces", self.bridge.as_str()])?;
        let mut ids = BTreeSet::new();
        for iface in ifaces.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let out = run(
                "ovs-vsctl",
                &[
                    "--if-exists",
                    "get",
                    "Interface",
                    iface,
                    "external_ids:iface-id",
                ],
            )?;
            let id = unquote(&out);
            if !id.is_empty() {
                ids.insert(id.to_string());
            }
        }
        Ok(ids)
    }
}
